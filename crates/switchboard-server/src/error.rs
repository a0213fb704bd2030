//! Server error types.

use switchboard_proto::ProtocolError;
use thiserror::Error;

/// Errors that can occur in the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, bad option value, etc.).
    ///
    /// These are fatal errors that prevent the server from attaching. Fix
    /// configuration and attach again.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport/network error (bind failure, I/O error, etc.).
    ///
    /// Raised by `attach` when the listening endpoint cannot be bound. The
    /// server stays unattached.
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection attempt refused during admission.
    ///
    /// Covers an unknown handshake path, a disallowed transport and a denied
    /// origin. Only surfaced by engines whose connect call returns to the
    /// caller; the WebSocket engine answers with an HTTP status instead.
    #[error("connection rejected: {0}")]
    Rejected(String),

    /// Protocol error (initial packet could not be encoded).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Internal error (unexpected state, logic bug, etc.).
    ///
    /// Should never happen in correct implementation. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Failure inside an origin predicate.
///
/// Never propagated: admission treats it as a denial.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("admission check failed: {0}")]
pub struct AdmissionError(pub String);

impl AdmissionError {
    /// Create an admission error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transport_errors() {
        let err: ServerError =
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use").into();
        assert!(matches!(err, ServerError::Transport(ref msg) if msg.contains("in use")));
    }

    #[test]
    fn protocol_error_display() {
        let err = ServerError::from(ProtocolError::BinaryUnsupported);
        assert!(err.to_string().starts_with("protocol error"));
    }
}
