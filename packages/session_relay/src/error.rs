//! Error type shared by every relay layer, with stable machine-readable codes.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Malformed invocation arguments. Raised before any network I/O.
    #[error("invalid arguments: {0}")]
    Validation(String),

    /// Nothing matching arrived before the caller's deadline. A session that
    /// never existed looks exactly like this.
    #[error("no message on session {session} within {waited:?}")]
    Timeout { session: String, waited: Duration },

    #[error("expected message from [{expected}], not [{actual}]")]
    SenderMismatch { expected: String, actual: String },

    #[error("unexpected control message during connection setup: {received:?}")]
    ProtocolViolation { received: Vec<u8> },

    #[error("failed sending message to {endpoint}: {reason}")]
    NetworkSend { endpoint: String, reason: String },

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("closed: {0}")]
    Closed(String),
}

impl RelayError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Timeout { .. } => "timeout",
            Self::SenderMismatch { .. } => "sender_mismatch",
            Self::ProtocolViolation { .. } => "protocol_violation",
            Self::NetworkSend { .. } => "network_send_failure",
            Self::InvalidCredential(_) => "invalid_credential",
            Self::Encoding(_) => "encoding",
            Self::Closed(_) => "closed",
        }
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::NetworkSend { .. })
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}
