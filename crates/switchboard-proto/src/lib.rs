//! Switchboard wire protocol.
//!
//! Two layers travel over every transport connection:
//!
//! - [`EnginePacket`]: transport framing (open handshake, ping/pong, close,
//!   message). Owned by the transport engine.
//! - [`Packet`]: namespace-level packets (connect, disconnect, event, ack)
//!   carried inside engine `Message` packets.
//!
//! Namespace packets are turned into wire text by an [`Encoder`] and back by a
//! [`Decoder`]. [`TextCodec`] implements both for the text format:
//!
//! ```text
//! <type digit>[<namespace>,][<ack id>][<json payload>]
//! ```
//!
//! The namespace segment is omitted for the default namespace `/`, so the
//! implicit "connected to `/`" packet encodes to the single character `0`.
//!
//! This crate performs no I/O.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod codec;
pub mod engine;
mod errors;
mod packet;

pub use codec::{Decoder, Encoder, TextCodec};
pub use engine::{EnginePacket, OpenHandshake};
pub use errors::{ProtocolError, Result};
pub use packet::{DEFAULT_NAMESPACE, Packet, PacketType};
