//! A client's membership in one namespace.
//!
//! A [`Socket`] exists from the moment a namespace accepts a connect request
//! until its local-close path runs. It writes through the shared transport of
//! its client and keeps its room memberships in the namespace adapter.
//!
//! # Invariants
//!
//! - `on_close` runs at most once; afterwards the socket is in no room and is
//!   not listed by its namespace.
//! - Handlers are invoked without any lock held, so they may freely call back
//!   into the socket or its namespace.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use switchboard_proto::{Encoder, Packet, PacketType};
use tracing::{debug, trace};

use crate::{
    adapter::{Room, SocketId},
    error::SocketError,
    namespace::{BroadcastOperator, Namespace},
    transport::{Handshake, Transport},
};

/// Reason passed to disconnect handlers when the server drops a socket.
pub const SERVER_DISCONNECT: &str = "server namespace disconnect";

/// Reason passed to disconnect handlers when the client leaves a namespace.
pub const CLIENT_DISCONNECT: &str = "client namespace disconnect";

type EventHandler = Arc<dyn Fn(&Arc<Socket>, &[Value], Option<AckSender>) + Send + Sync>;
type AnyHandler = Arc<dyn Fn(&Arc<Socket>, &str, &[Value], Option<AckSender>) + Send + Sync>;
type DisconnectHandler = Arc<dyn Fn(&Arc<Socket>, &str) + Send + Sync>;
type AckCallback = Box<dyn FnOnce(&[Value]) + Send>;

/// Replies to an event that carried an ack id.
///
/// Clones share the same slot: only the first `send` reaches the client.
#[derive(Clone)]
pub struct AckSender {
    transport: Arc<dyn Transport>,
    encoder: Arc<dyn Encoder>,
    nsp: String,
    id: u64,
    sent: Arc<AtomicBool>,
}

impl AckSender {
    /// Ack id being answered.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send the acknowledgement.
    ///
    /// Returns `Ok(false)` if this ack was already answered.
    pub fn send(&self, args: Vec<Value>) -> Result<bool, SocketError> {
        if self.sent.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let encoded = self.encoder.encode(&Packet::ack(self.nsp.clone(), self.id, args))?;
        self.transport.send(encoded)?;
        Ok(true)
    }
}

impl std::fmt::Debug for AckSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckSender").field("nsp", &self.nsp).field("id", &self.id).finish()
    }
}

/// A client connected to one namespace.
pub struct Socket {
    id: SocketId,
    nsp: Arc<Namespace>,
    transport: Arc<dyn Transport>,
    handshake: Arc<Handshake>,
    connected: AtomicBool,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    any_handlers: RwLock<Vec<AnyHandler>>,
    disconnect_handlers: RwLock<Vec<DisconnectHandler>>,
    next_ack: AtomicU64,
    pending_acks: Mutex<HashMap<u64, AckCallback>>,
}

impl Socket {
    pub(crate) fn new(
        id: SocketId,
        nsp: Arc<Namespace>,
        transport: Arc<dyn Transport>,
        handshake: Arc<Handshake>,
    ) -> Self {
        Self {
            id,
            nsp,
            transport,
            handshake,
            connected: AtomicBool::new(true),
            handlers: RwLock::new(HashMap::new()),
            any_handlers: RwLock::new(Vec::new()),
            disconnect_handlers: RwLock::new(Vec::new()),
            next_ack: AtomicU64::new(0),
            pending_acks: Mutex::new(HashMap::new()),
        }
    }

    /// Socket id. Equal to the client id in `/`, `<nsp>#<client id>` elsewhere.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the underlying client connection.
    pub fn client_id(&self) -> &str {
        self.transport.id()
    }

    /// Namespace this socket belongs to.
    pub fn nsp(&self) -> &Arc<Namespace> {
        &self.nsp
    }

    /// Request metadata captured at connection time.
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Whether the socket is still part of its namespace.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Emit an event to this client.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), SocketError> {
        self.packet(Packet::event(self.nsp.name(), event, args))
    }

    /// Emit an event and register a callback for the client's ack.
    ///
    /// Returns the ack id used on the wire.
    pub fn emit_with_ack<F>(
        &self,
        event: &str,
        args: Vec<Value>,
        callback: F,
    ) -> Result<u64, SocketError>
    where
        F: FnOnce(&[Value]) + Send + 'static,
    {
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        self.pending_acks.lock().insert(id, Box::new(callback));

        let packet = Packet::event(self.nsp.name(), event, args).with_id(id);
        if let Err(err) = self.packet(packet) {
            self.pending_acks.lock().remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// Emit a `message` event.
    pub fn send(&self, args: Vec<Value>) -> Result<(), SocketError> {
        self.emit("message", args)
    }

    /// Alias of [`Socket::send`].
    pub fn write(&self, args: Vec<Value>) -> Result<(), SocketError> {
        self.send(args)
    }

    /// Encode and write a packet.
    pub fn packet(&self, packet: Packet) -> Result<(), SocketError> {
        if !self.connected() {
            return Err(SocketError::Disconnected);
        }
        let encoded = self.nsp.encoder().encode(&packet)?;
        self.transport.send(encoded)
    }

    /// Write an already-encoded packet. Used by broadcasts, which encode once.
    pub(crate) fn send_raw(&self, encoded: String) -> Result<(), SocketError> {
        if !self.connected() {
            return Err(SocketError::Disconnected);
        }
        self.transport.send(encoded)
    }

    /// Join a room.
    pub fn join(&self, room: &str) {
        self.nsp.with_adapter(|adapter| adapter.add(&self.id, room));
    }

    /// Leave a room.
    pub fn leave(&self, room: &str) {
        self.nsp.with_adapter(|adapter| adapter.del(&self.id, room));
    }

    /// Rooms this socket is in.
    pub fn rooms(&self) -> Vec<Room> {
        self.nsp.with_adapter(|adapter| adapter.rooms_of(&self.id))
    }

    /// Broadcast to a room, excluding this socket.
    pub fn to(&self, room: &str) -> BroadcastOperator {
        self.broadcast().to(room)
    }

    /// Broadcast to the whole namespace, excluding this socket.
    pub fn broadcast(&self) -> BroadcastOperator {
        BroadcastOperator::new(Arc::clone(&self.nsp)).except(&self.id)
    }

    /// Register a handler for an inbound event.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&Arc<Socket>, &[Value], Option<AckSender>) + Send + Sync + 'static,
    {
        self.handlers.write().entry(event.to_string()).or_default().push(Arc::new(handler));
    }

    /// Register a handler for every inbound event, called after the named
    /// handlers with the event name.
    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&Arc<Socket>, &str, &[Value], Option<AckSender>) + Send + Sync + 'static,
    {
        self.any_handlers.write().push(Arc::new(handler));
    }

    /// Register a handler that runs once the socket has left its namespace.
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(&Arc<Socket>, &str) + Send + Sync + 'static,
    {
        self.disconnect_handlers.write().push(Arc::new(handler));
    }

    /// Disconnect from the namespace.
    ///
    /// Tells the client, runs the local-close path, and with
    /// `close_transport` also closes the underlying connection (which ends
    /// every other socket of the same client).
    pub fn disconnect(self: &Arc<Self>, close_transport: bool) {
        if !self.connected() {
            return;
        }

        if let Err(err) = self.packet(Packet::disconnect(self.nsp.name())) {
            debug!(sid = %self.id, error = %err, "disconnect packet not delivered");
        }
        self.on_close(SERVER_DISCONNECT);

        if close_transport {
            self.transport.close();
        }
    }

    /// Local-close path.
    ///
    /// Leaves all rooms, deregisters from the namespace, drops pending acks and
    /// runs the disconnect handlers. Idempotent.
    pub fn on_close(self: &Arc<Self>, reason: &str) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }

        debug!(sid = %self.id, nsp = %self.nsp.name(), reason, "socket closed");

        self.nsp.remove(&self.id);
        self.pending_acks.lock().clear();

        let handlers = self.disconnect_handlers.read().clone();
        for handler in handlers {
            handler(self, reason);
        }
    }

    /// Route an inbound `Event` or `Ack` packet.
    pub(crate) fn dispatch(self: &Arc<Self>, packet: &Packet) {
        match packet.kind {
            PacketType::Event => self.on_event(packet),
            PacketType::Ack => self.on_ack(packet),
            other => trace!(sid = %self.id, kind = ?other, "ignoring packet"),
        }
    }

    fn on_event(self: &Arc<Self>, packet: &Packet) {
        let Some(name) = packet.event_name() else {
            return;
        };

        let handlers = self.handlers.read().get(name).cloned().unwrap_or_default();
        let any = self.any_handlers.read().clone();
        if handlers.is_empty() && any.is_empty() {
            trace!(sid = %self.id, event = name, "no handler");
            return;
        }

        let ack = packet.id.map(|id| AckSender {
            transport: Arc::clone(&self.transport),
            encoder: Arc::clone(self.nsp.encoder()),
            nsp: self.nsp.name().to_string(),
            id,
            sent: Arc::new(AtomicBool::new(false)),
        });

        for handler in handlers {
            handler(self, packet.args(), ack.clone());
        }
        for handler in any {
            handler(self, name, packet.args(), ack.clone());
        }
    }

    fn on_ack(&self, packet: &Packet) {
        let Some(id) = packet.id else {
            return;
        };

        let callback = self.pending_acks.lock().remove(&id);
        match callback {
            Some(callback) => callback(packet.args()),
            None => debug!(sid = %self.id, id, "ack for unknown id"),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("nsp", &self.nsp.name())
            .field("connected", &self.connected())
            .finish_non_exhaustive()
    }
}
