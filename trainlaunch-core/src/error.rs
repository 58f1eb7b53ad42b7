use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid launch plan: {0}")]
    InvalidPlan(String),

    #[error("Entrypoint not found: {0}")]
    EntrypointNotFound(String),

    #[error("Failed to spawn entrypoint: {0}")]
    SpawnError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LaunchError>;
