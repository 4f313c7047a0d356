use thiserror::Error;

/// Errors produced while parsing or building SIP messages and SDP bodies
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The message is not valid SIP (bad start line, framing, encoding)
    #[error("Parse error: {0}")]
    Parse(String),

    /// A header required for the operation is absent
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    /// A header is present but its value is malformed
    #[error("Invalid {name} header: {reason}")]
    InvalidHeader { name: String, reason: String },

    /// Malformed URI
    #[error("Invalid URI '{0}'")]
    InvalidUri(String),

    /// Malformed SDP body
    #[error("SDP error: {0}")]
    Sdp(String),
}

impl Error {
    pub(crate) fn invalid_header(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidHeader {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for message operations
pub type Result<T> = std::result::Result<T, Error>;
