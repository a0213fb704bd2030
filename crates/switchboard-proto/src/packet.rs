//! Namespace-level packets.
//!
//! A [`Packet`] is addressed to exactly one namespace. The payload is kept as
//! a JSON value; its shape depends on the packet type:
//!
//! - `Connect`: optional object (auth data from the client, `{sid}` from the
//!   server)
//! - `ConnectError`: `{"message": ...}`
//! - `Event`: array whose first element is the event name
//! - `Ack`: array of acknowledgement arguments
//! - `Disconnect`: no payload

use serde_json::{Value, json};

/// Name of the default namespace. Every server has it.
pub const DEFAULT_NAMESPACE: &str = "/";

/// Packet type, encoded as a single leading digit on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Join a namespace (client → server) or confirm the join (server → client)
    Connect = 0,
    /// Leave a namespace
    Disconnect = 1,
    /// Named event with arguments
    Event = 2,
    /// Acknowledgement of an event carrying an id
    Ack = 3,
    /// Namespace join was refused
    ConnectError = 4,
    /// Event with binary attachments
    BinaryEvent = 5,
    /// Ack with binary attachments
    BinaryAck = 6,
}

impl PacketType {
    /// Convert from the wire digit value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Connect),
            1 => Some(Self::Disconnect),
            2 => Some(Self::Event),
            3 => Some(Self::Ack),
            4 => Some(Self::ConnectError),
            5 => Some(Self::BinaryEvent),
            6 => Some(Self::BinaryAck),
            _ => None,
        }
    }

    /// Wire digit value.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether this type carries binary attachments.
    pub fn is_binary(self) -> bool {
        matches!(self, Self::BinaryEvent | Self::BinaryAck)
    }
}

/// A namespace-level packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Packet type
    pub kind: PacketType,
    /// Target namespace, always starting with `/`
    pub nsp: String,
    /// Ack id for events expecting an acknowledgement, or the id being
    /// acknowledged
    pub id: Option<u64>,
    /// JSON payload
    pub data: Option<Value>,
}

impl Packet {
    fn new(kind: PacketType, nsp: impl Into<String>, data: Option<Value>) -> Self {
        Self { kind, nsp: nsp.into(), id: None, data }
    }

    /// `Connect` packet without payload.
    pub fn connect(nsp: impl Into<String>) -> Self {
        Self::new(PacketType::Connect, nsp, None)
    }

    /// `Connect` packet carrying a payload object.
    pub fn connect_with(nsp: impl Into<String>, data: Value) -> Self {
        Self::new(PacketType::Connect, nsp, Some(data))
    }

    /// `ConnectError` packet with a human-readable message.
    pub fn connect_error(nsp: impl Into<String>, message: &str) -> Self {
        Self::new(PacketType::ConnectError, nsp, Some(json!({ "message": message })))
    }

    /// `Disconnect` packet.
    pub fn disconnect(nsp: impl Into<String>) -> Self {
        Self::new(PacketType::Disconnect, nsp, None)
    }

    /// `Event` packet: `[event, ...args]`.
    pub fn event(nsp: impl Into<String>, event: &str, args: Vec<Value>) -> Self {
        let mut items = Vec::with_capacity(args.len() + 1);
        items.push(Value::String(event.to_string()));
        items.extend(args);
        Self::new(PacketType::Event, nsp, Some(Value::Array(items)))
    }

    /// `Ack` packet answering event `id`.
    pub fn ack(nsp: impl Into<String>, id: u64, args: Vec<Value>) -> Self {
        Self::new(PacketType::Ack, nsp, Some(Value::Array(args))).with_id(id)
    }

    /// Attach an ack id.
    #[must_use]
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Event name for `Event` packets.
    pub fn event_name(&self) -> Option<&str> {
        if self.kind != PacketType::Event {
            return None;
        }
        match &self.data {
            Some(Value::Array(items)) => items.first().and_then(Value::as_str),
            _ => None,
        }
    }

    /// Event arguments (everything after the name) for `Event` packets, or
    /// the acknowledgement arguments for `Ack` packets.
    pub fn args(&self) -> &[Value] {
        let Some(Value::Array(items)) = &self.data else {
            return &[];
        };

        match self.kind {
            PacketType::Event if !items.is_empty() => &items[1..],
            PacketType::Ack => items,
            _ => &[],
        }
    }

    /// Message carried by a `ConnectError` packet.
    pub fn error_message(&self) -> Option<&str> {
        if self.kind != PacketType::ConnectError {
            return None;
        }
        match &self.data {
            Some(Value::Object(map)) => map.get("message").and_then(Value::as_str),
            Some(Value::String(message)) => Some(message),
            _ => None,
        }
    }
}
