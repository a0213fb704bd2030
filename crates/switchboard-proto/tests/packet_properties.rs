//! Property-based tests for the text codec
//!
//! The decoder faces untrusted input from every connected client, so the key
//! properties are about robustness: it never panics, and anything the encoder
//! produces is read back unchanged.

use proptest::prelude::*;
use serde_json::{Value, json};
use switchboard_proto::{Decoder, Encoder, EnginePacket, Packet, PacketType, TextCodec};

/// Strategy for canonical namespace names
fn arbitrary_namespace() -> impl Strategy<Value = String> {
    prop_oneof![Just("/".to_string()), "/[a-z][a-z0-9_-]{0,12}".prop_map(|s| s)]
}

/// Strategy for small JSON argument values
fn arbitrary_arg() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[ -~]{0,24}".prop_map(Value::String),
    ]
}

/// Strategy for packets the server actually emits
fn arbitrary_packet() -> impl Strategy<Value = Packet> {
    (
        arbitrary_namespace(),
        "[a-z]{1,12}",
        prop::collection::vec(arbitrary_arg(), 0..4),
        prop::option::of(any::<u64>()),
        0u8..4,
    )
        .prop_map(|(nsp, event, args, id, shape)| match shape {
            0 => Packet::connect(nsp),
            1 => Packet::disconnect(nsp),
            2 => {
                let packet = Packet::event(nsp, &event, args);
                match id {
                    Some(id) => packet.with_id(id),
                    None => packet,
                }
            },
            _ => Packet::ack(nsp, id.unwrap_or_default(), args),
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: decode(encode(p)) == p for every packet the server emits
    #[test]
    fn prop_encoded_packets_decode_unchanged(packet in arbitrary_packet()) {
        let encoded = TextCodec.encode(&packet)?;
        let decoded = TextCodec.decode(&encoded)?;
        prop_assert_eq!(decoded, packet);
    }

    /// Property: the default namespace never appears on the wire
    #[test]
    fn prop_default_namespace_is_elided(packet in arbitrary_packet()) {
        let encoded = TextCodec.encode(&packet)?;
        if packet.nsp == "/" {
            prop_assert!(!encoded[1..].starts_with('/'));
        } else {
            let prefix = format!("{},", packet.nsp);
            prop_assert!(encoded[1..].starts_with(&prefix));
        }
    }

    /// Property: decoding arbitrary text never panics
    #[test]
    fn prop_decode_never_panics(input in "\\PC{0,64}") {
        let _ = TextCodec.decode(&input);
        let _ = EnginePacket::decode(&input);
    }

    /// Property: decoded packets always carry a canonical namespace
    #[test]
    fn prop_decoded_namespace_is_canonical(input in "[0-4](/[a-z]{0,6},)?[0-9]{0,3}(\\[\"[a-z]{1,4}\"\\])?") {
        if let Ok(packet) = TextCodec.decode(&input) {
            prop_assert!(packet.nsp.starts_with('/'));
            prop_assert!(!packet.kind.is_binary());
            if packet.kind == PacketType::Event {
                prop_assert!(packet.event_name().is_some());
            }
        }
    }
}
