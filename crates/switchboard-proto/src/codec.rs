//! Packet encoder and decoder.
//!
//! The traits are the seam the server consumes; [`TextCodec`] is the stock
//! implementation. Encoding a packet is deterministic, so broadcast paths
//! encode once and reuse the string for every recipient.

use serde_json::Value;

use crate::{
    errors::{ProtocolError, Result},
    packet::{DEFAULT_NAMESPACE, Packet, PacketType},
};

/// Turns packets into wire text.
pub trait Encoder: Send + Sync {
    /// Encode a single packet.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::BinaryUnsupported` for binary packet types
    /// - `ProtocolError::InvalidNamespace` if `packet.nsp` is not canonical
    fn encode(&self, packet: &Packet) -> Result<String>;
}

/// Turns wire text back into packets.
pub trait Decoder: Send + Sync {
    /// Decode a single packet.
    ///
    /// Never panics on arbitrary input.
    fn decode(&self, input: &str) -> Result<Packet>;
}

/// Text codec for the `<type>[<nsp>,][<id>][<json>]` format.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl TextCodec {
    /// Create a new codec.
    pub fn new() -> Self {
        Self
    }
}

impl Encoder for TextCodec {
    fn encode(&self, packet: &Packet) -> Result<String> {
        if packet.kind.is_binary() {
            return Err(ProtocolError::BinaryUnsupported);
        }

        if !packet.nsp.starts_with('/') || packet.nsp.contains(',') {
            return Err(ProtocolError::InvalidNamespace(packet.nsp.clone()));
        }

        let mut out = String::with_capacity(16);
        out.push(char::from(b'0' + packet.kind.to_u8()));

        if packet.nsp != DEFAULT_NAMESPACE {
            out.push_str(&packet.nsp);
            out.push(',');
        }

        if let Some(id) = packet.id {
            out.push_str(&id.to_string());
        }

        if let Some(data) = &packet.data {
            out.push_str(&serde_json::to_string(data)?);
        }

        Ok(out)
    }
}

impl Decoder for TextCodec {
    fn decode(&self, input: &str) -> Result<Packet> {
        let first = *input.as_bytes().first().ok_or(ProtocolError::Empty)?;

        let kind = first
            .checked_sub(b'0')
            .and_then(PacketType::from_u8)
            .ok_or(ProtocolError::UnknownType(first))?;

        if kind.is_binary() {
            return Err(ProtocolError::BinaryUnsupported);
        }

        // The type byte is ASCII, so slicing at 1 is on a char boundary.
        let mut rest = &input[1..];

        let nsp = if rest.starts_with('/') {
            match rest.find(',') {
                Some(end) => {
                    let nsp = &rest[..end];
                    rest = &rest[end + 1..];
                    nsp
                },
                None => {
                    let nsp = rest;
                    rest = "";
                    nsp
                },
            }
        } else {
            DEFAULT_NAMESPACE
        };

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let id = if digits > 0 {
            let id = rest[..digits].parse::<u64>().map_err(|_| ProtocolError::InvalidAckId)?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let data = if rest.is_empty() { None } else { Some(serde_json::from_str::<Value>(rest)?) };

        validate_shape(kind, data.as_ref())?;

        Ok(Packet { kind, nsp: nsp.to_string(), id, data })
    }
}

fn validate_shape(kind: PacketType, data: Option<&Value>) -> Result<()> {
    match (kind, data) {
        (PacketType::Event, Some(Value::Array(items)))
            if items.first().is_some_and(Value::is_string) =>
        {
            Ok(())
        },
        (PacketType::Event, _) => Err(ProtocolError::InvalidPayload(
            "event payload must be an array starting with the event name".to_string(),
        )),
        (PacketType::Ack, Some(Value::Array(_))) => Ok(()),
        (PacketType::Ack, _) => {
            Err(ProtocolError::InvalidPayload("ack payload must be an array".to_string()))
        },
        (PacketType::Connect, None | Some(Value::Object(_)))
        | (PacketType::ConnectError, None | Some(Value::Object(_) | Value::String(_)))
        | (PacketType::Disconnect, None) => Ok(()),
        (kind, Some(_)) => {
            Err(ProtocolError::InvalidPayload(format!("unexpected payload for {kind:?}")))
        },
        (_, None) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn default_namespace_connect_is_single_digit() {
        let encoded = TextCodec.encode(&Packet::connect("/")).unwrap();
        assert_eq!(encoded, "0");
    }

    #[test]
    fn custom_namespace_is_prefixed() {
        let encoded = TextCodec.encode(&Packet::connect("/admin")).unwrap();
        assert_eq!(encoded, "0/admin,");
    }

    #[test]
    fn event_with_ack_id() {
        let packet = Packet::event("/chat", "msg", vec![json!("hi")]).with_id(12);
        let encoded = TextCodec.encode(&packet).unwrap();
        assert_eq!(encoded, r#"2/chat,12["msg","hi"]"#);

        let decoded = TextCodec.decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn decode_namespace_without_trailing_comma() {
        let decoded = TextCodec.decode("1/chat").unwrap();
        assert_eq!(decoded.kind, PacketType::Disconnect);
        assert_eq!(decoded.nsp, "/chat");
        assert_eq!(decoded.data, None);
    }

    #[test]
    fn decode_connect_error_message() {
        let decoded = TextCodec.decode(r#"4{"message":"Not authorized"}"#).unwrap();
        assert_eq!(decoded.error_message(), Some("Not authorized"));
    }

    #[test]
    fn rejects_empty_and_unknown() {
        assert_eq!(TextCodec.decode(""), Err(ProtocolError::Empty));
        assert_eq!(TextCodec.decode("9"), Err(ProtocolError::UnknownType(b'9')));
        assert_eq!(TextCodec.decode("x"), Err(ProtocolError::UnknownType(b'x')));
    }

    #[test]
    fn rejects_binary() {
        assert_eq!(TextCodec.decode(r#"51-["a",{"_placeholder":true,"num":0}]"#), Err(
            ProtocolError::BinaryUnsupported
        ));
        let packet = Packet { kind: PacketType::BinaryAck, nsp: "/".into(), id: None, data: None };
        assert_eq!(TextCodec.encode(&packet), Err(ProtocolError::BinaryUnsupported));
    }

    #[test]
    fn rejects_event_without_name() {
        assert!(matches!(TextCodec.decode("2[1,2]"), Err(ProtocolError::InvalidPayload(_))));
        assert!(matches!(TextCodec.decode("2"), Err(ProtocolError::InvalidPayload(_))));
    }

    #[test]
    fn rejects_overflowing_ack_id() {
        assert_eq!(TextCodec.decode("399999999999999999999999[]"), Err(ProtocolError::InvalidAckId));
    }

    #[test]
    fn rejects_non_canonical_namespace_on_encode() {
        let packet = Packet::connect("chat");
        assert_eq!(TextCodec.encode(&packet), Err(ProtocolError::InvalidNamespace("chat".into())));
    }
}
