//! Error types for the switchboard core.
//!
//! Every error here is scoped to a single socket, client or broadcast. None of
//! them may leak into the registry or affect other connections.

use serde_json::Value;
use switchboard_proto::ProtocolError;
use thiserror::Error;

use crate::session::SessionState;

/// Errors from sending to a single socket.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// Socket already left its namespace
    #[error("socket is disconnected")]
    Disconnected,

    /// Underlying transport rejected the write
    #[error("transport error: {0}")]
    Transport(String),

    /// Packet could not be encoded
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Failure returned by a namespace middleware.
///
/// The message is sent to the client in a `ConnectError` packet and the socket
/// is never registered with the namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct MiddlewareError {
    message: String,
    data: Option<Value>,
}

impl MiddlewareError {
    /// Create an error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), data: None }
    }

    /// Attach extra JSON data for the client.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Message sent to the client.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Extra data, if any.
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }
}

impl std::fmt::Display for MiddlewareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for MiddlewareError {}

/// Errors from joining a namespace.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectError {
    /// No namespace registered under this name
    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    /// A middleware refused the connection
    #[error("{0}")]
    Rejected(MiddlewareError),

    /// Failed to send the connect confirmation
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
}

/// Errors from an adapter backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Backend cannot currently serve requests (e.g. lost its broker link)
    #[error("adapter unavailable: {0}")]
    Unavailable(String),
}

/// Errors from namespace-wide broadcasts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// Packet could not be encoded
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Adapter failed to resolve recipients
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),
}

/// Errors from the engine session state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation not valid in the current state
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when error occurred
        state: SessionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Packet not valid in the current state
    #[error("unexpected packet {packet} in state {state:?}")]
    UnexpectedPacket {
        /// Current state when packet was received
        state: SessionState,
        /// Short name of the packet
        packet: &'static str,
    },

    /// Handshake body could not be encoded
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Returns true if the peer violated the protocol.
    ///
    /// State errors on our side are bugs; packet errors mean a broken or
    /// malicious peer and warrant closing the connection.
    pub fn is_peer_error(&self) -> bool {
        matches!(self, Self::UnexpectedPacket { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn middleware_error_displays_message() {
        let err = MiddlewareError::new("Not authorized");
        assert_eq!(err.to_string(), "Not authorized");
        assert_eq!(ConnectError::Rejected(err).to_string(), "Not authorized");
    }

    #[test]
    fn invalid_namespace_display() {
        let err = ConnectError::InvalidNamespace("/nope".to_string());
        assert_eq!(err.to_string(), "Invalid namespace: /nope");
    }

    #[test]
    fn unexpected_packets_are_peer_errors() {
        let err = SessionError::UnexpectedPacket { state: SessionState::Open, packet: "open" };
        assert!(err.is_peer_error());

        let err = SessionError::InvalidState { state: SessionState::Closed, operation: "open" };
        assert!(!err.is_peer_error());
    }
}
