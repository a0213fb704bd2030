//! Protocol error types.

use thiserror::Error;

/// Errors produced while encoding or decoding packets.
///
/// All of these are fatal for the packet in question but never for the
/// connection as a whole; the caller decides whether to drop the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input was empty
    #[error("empty packet")]
    Empty,

    /// Leading type byte is not a known packet type
    #[error("unknown packet type: {0:#04x}")]
    UnknownType(u8),

    /// Binary packet types need attachment reassembly, which this codec does
    /// not implement
    #[error("binary packets are not supported")]
    BinaryUnsupported,

    /// Namespace does not start with `/` or contains a `,`
    #[error("invalid namespace: {0:?}")]
    InvalidNamespace(String),

    /// Ack id is not a valid `u64`
    #[error("invalid ack id")]
    InvalidAckId,

    /// JSON payload is malformed or has the wrong shape for the packet type
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Transport framing packet is malformed
    #[error("invalid engine packet: {0}")]
    InvalidEnginePacket(String),
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}
