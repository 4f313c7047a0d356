use thiserror::Error;

/// Result type for dialog-core operations
pub type DialogResult<T> = Result<T, DialogError>;

/// Errors raised by the transaction manager and user agents
#[derive(Debug, Error)]
pub enum DialogError {
    /// A client transaction with the same identifier is already running
    #[error("Transaction already exists: {tid}")]
    TransactionExists { tid: String },

    /// No transaction matches
    #[error("No transaction found: {tid}")]
    NoTransaction { tid: String },

    /// The transaction manager was shut down
    #[error("Transaction manager is shut down")]
    ShutDown,

    /// Message violates what the operation requires
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Operation not allowed in the current state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Configuration rejected by validation
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Media relay command failed
    #[error("Media relay error: {message}")]
    Relay { message: String },

    /// SIP message model error
    #[error("SIP error: {0}")]
    Sip(#[from] b2bua_sip_core::Error),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] b2bua_sip_transport::Error),

    /// Clock, timer or logging infrastructure error
    #[error("Infrastructure error: {0}")]
    Infra(#[from] b2bua_infra_common::Error),
}

impl DialogError {
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn relay(message: impl Into<String>) -> Self {
        Self::Relay {
            message: message.into(),
        }
    }

    pub fn transaction_exists(tid: impl ToString) -> Self {
        Self::TransactionExists { tid: tid.to_string() }
    }

    pub fn no_transaction(tid: impl ToString) -> Self {
        Self::NoTransaction { tid: tid.to_string() }
    }
}
