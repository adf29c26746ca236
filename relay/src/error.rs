//! Error types for the relay

use thiserror::Error;

// Re-export StageError from streams-core
pub use streams_core::StageError;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),

    /// A pipeline stage failed
    #[error(transparent)]
    Stage(#[from] StageError),

    /// Shutdown requested
    #[error("shutdown requested")]
    Shutdown,
}

impl From<serde_yaml::Error> for RelayError {
    fn from(err: serde_yaml::Error) -> Self {
        RelayError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}
