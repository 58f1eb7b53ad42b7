mod error;
mod models;

pub use error::{LaunchError, Result};
pub use models::*;
