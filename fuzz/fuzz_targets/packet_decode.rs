//! Fuzz target for the text decoders
//!
//! Feeds arbitrary text to both the namespace packet decoder and the engine
//! packet decoder, looking for:
//! - Panics on slicing at non-ASCII boundaries
//! - Ack ids that overflow
//! - Namespace segments without a terminating comma
//!
//! The fuzzer should NEVER panic. Invalid input must return an error, and
//! anything that decodes must re-encode and decode to the same packet.

#![no_main]

use libfuzzer_sys::fuzz_target;
use switchboard_proto::{Decoder, Encoder, EnginePacket, TextCodec};

fuzz_target!(|data: &str| {
    if let Ok(packet) = TextCodec.decode(data) {
        if let Ok(encoded) = TextCodec.encode(&packet) {
            let again = TextCodec.decode(&encoded);
            assert_eq!(again.as_ref(), Ok(&packet), "re-decode of {encoded:?} differs");
        }
    }

    if let Ok(packet) = EnginePacket::decode(data) {
        assert_eq!(EnginePacket::decode(&packet.encode()), Ok(packet));
    }
});
