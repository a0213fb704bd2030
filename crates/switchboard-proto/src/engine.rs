//! Transport-level framing.
//!
//! Every transport frame starts with a single type digit. The engine owns
//! these packets; namespace packets travel as the body of [`EnginePacket::Message`].
//!
//! ```text
//! 0{"sid":..}   open (server → client, first frame of every connection)
//! 1             close
//! 2[probe]      ping
//! 3[probe]      pong
//! 4<text>       message
//! 5             upgrade
//! 6             noop
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// A transport-level packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    /// Open handshake carrying the JSON-encoded [`OpenHandshake`]
    Open(String),
    /// Close the transport
    Close,
    /// Heartbeat request with optional probe payload
    Ping(Option<String>),
    /// Heartbeat response with optional probe payload
    Pong(Option<String>),
    /// Application message (an encoded namespace packet)
    Message(String),
    /// Transport upgrade marker
    Upgrade,
    /// No-op
    Noop,
}

impl EnginePacket {
    /// Encode to wire text.
    pub fn encode(&self) -> String {
        match self {
            Self::Open(body) => format!("0{body}"),
            Self::Close => "1".to_string(),
            Self::Ping(probe) => format!("2{}", probe.as_deref().unwrap_or_default()),
            Self::Pong(probe) => format!("3{}", probe.as_deref().unwrap_or_default()),
            Self::Message(body) => format!("4{body}"),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }

    /// Decode from wire text.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Empty` for empty input
    /// - `ProtocolError::InvalidEnginePacket` for an unknown type digit
    pub fn decode(input: &str) -> Result<Self> {
        let first = *input.as_bytes().first().ok_or(ProtocolError::Empty)?;
        // Not a char boundary only when the first byte isn't a type digit
        let body = input.get(1..).unwrap_or_default();
        let probe = || if body.is_empty() { None } else { Some(body.to_string()) };

        match first {
            b'0' => Ok(Self::Open(body.to_string())),
            b'1' => Ok(Self::Close),
            b'2' => Ok(Self::Ping(probe())),
            b'3' => Ok(Self::Pong(probe())),
            b'4' => Ok(Self::Message(body.to_string())),
            b'5' => Ok(Self::Upgrade),
            b'6' => Ok(Self::Noop),
            other => {
                Err(ProtocolError::InvalidEnginePacket(format!("unknown type byte {other:#04x}")))
            },
        }
    }
}

/// Body of the `Open` packet sent as the first frame of every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    /// Session id assigned by the engine
    pub sid: String,
    /// Transports the client may upgrade to
    pub upgrades: Vec<String>,
    /// Heartbeat interval in milliseconds
    pub ping_interval: u64,
    /// Heartbeat timeout in milliseconds
    pub ping_timeout: u64,
    /// Largest accepted message in bytes
    pub max_payload: u64,
}

impl OpenHandshake {
    /// Wrap this handshake into an `Open` packet.
    pub fn to_packet(&self) -> Result<EnginePacket> {
        Ok(EnginePacket::Open(serde_json::to_string(self)?))
    }

    /// Parse the body of an `Open` packet.
    pub fn from_packet(packet: &EnginePacket) -> Result<Self> {
        match packet {
            EnginePacket::Open(body) => Ok(serde_json::from_str(body)?),
            other => Err(ProtocolError::InvalidEnginePacket(format!("expected open, got {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_wraps_namespace_packet() {
        let packet = EnginePacket::Message("0".to_string());
        assert_eq!(packet.encode(), "40");
        assert_eq!(EnginePacket::decode("40").unwrap(), packet);
    }

    #[test]
    fn ping_probe_is_optional() {
        assert_eq!(EnginePacket::decode("2").unwrap(), EnginePacket::Ping(None));
        assert_eq!(
            EnginePacket::decode("3probe").unwrap(),
            EnginePacket::Pong(Some("probe".to_string()))
        );
        assert_eq!(EnginePacket::Ping(None).encode(), "2");
    }

    #[test]
    fn open_handshake_uses_camel_case() {
        let handshake = OpenHandshake {
            sid: "abc".to_string(),
            upgrades: vec![],
            ping_interval: 25_000,
            ping_timeout: 20_000,
            max_payload: 1_000_000,
        };
        let packet = handshake.to_packet().unwrap();
        let encoded = packet.encode();
        assert!(encoded.starts_with("0{"));
        assert!(encoded.contains("\"pingInterval\":25000"));

        let parsed = OpenHandshake::from_packet(&EnginePacket::decode(&encoded).unwrap()).unwrap();
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(matches!(EnginePacket::decode("9"), Err(ProtocolError::InvalidEnginePacket(_))));
        assert_eq!(EnginePacket::decode(""), Err(ProtocolError::Empty));
    }
}
