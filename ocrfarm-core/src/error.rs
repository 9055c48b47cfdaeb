//! Error types for farm operations

/// Result type for farm operations
pub type Result<T> = std::result::Result<T, FarmError>;

/// Error types shared across the farm crates
#[derive(Debug, thiserror::Error)]
pub enum FarmError {
    /// Profile name failed validation
    #[error("Invalid profile name: {0}")]
    InvalidProfile(String),

    /// Remote host configuration is malformed or unsafe
    #[error("Invalid host configuration: {0}")]
    InvalidHost(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Runtime state store failure
    #[error("State store error: {0}")]
    Store(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for FarmError {
    fn from(err: rusqlite::Error) -> Self {
        FarmError::Store(err.to_string())
    }
}

impl From<figment::Error> for FarmError {
    fn from(err: figment::Error) -> Self {
        FarmError::Configuration(err.to_string())
    }
}

impl From<String> for FarmError {
    fn from(s: String) -> Self {
        FarmError::Other(s)
    }
}

impl From<&str> for FarmError {
    fn from(s: &str) -> Self {
        FarmError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for FarmError {
    fn from(err: anyhow::Error) -> Self {
        FarmError::Other(err.to_string())
    }
}
