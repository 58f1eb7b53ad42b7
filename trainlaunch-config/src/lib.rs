mod launchfile;
mod overrides;

pub use launchfile::{
    default_plan, load_launchfile, parse_launchfile, DEFAULT_LAUNCHFILE, LAUNCHFILE_TEMPLATE,
};
pub use overrides::{parse_device_list, parse_env_assignment, Overrides};
