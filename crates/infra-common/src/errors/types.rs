use thiserror::Error;

/// Errors raised by the infrastructure layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The system clock could not be read (e.g. it reports a time before the epoch)
    #[error("Clock error: {0}")]
    Clock(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// The logging subscriber could not be installed
    #[error("Logging error: {0}")]
    Logging(String),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for infrastructure operations
pub type Result<T> = std::result::Result<T, Error>;
