use std::io;

use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum Error {
    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Destination host name could not be resolved
    #[error("Cannot resolve '{0}'")]
    Resolve(String),

    /// Failed to bind a local socket
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The transport was shut down
    #[error("Transport is closed")]
    Closed,

    /// Transport tasks need a tokio runtime
    #[error("No tokio runtime: {0}")]
    NoRuntime(String),
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;
