//! Namespaces and namespace-wide broadcasts.
//!
//! A [`Namespace`] is a named channel holding the sockets currently connected
//! to it. It owns the middleware chain run on every connect request, the
//! connection listeners, and the adapter that tracks room membership.
//!
//! # Invariants
//!
//! - A socket is listed by its namespace iff it passed every middleware and
//!   its local-close path has not run yet.
//! - Sockets are kept in connection order.
//! - Lock order is sockets before adapter. The adapter lock is never held
//!   while taking the sockets lock.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use switchboard_proto::{DEFAULT_NAMESPACE, Encoder, Packet};
use tracing::{debug, trace, warn};

use crate::{
    adapter::{Adapter, AdapterFactory, BroadcastOptions, SocketId},
    error::{BroadcastError, ConnectError, MiddlewareError},
    socket::Socket,
    transport::{Handshake, Transport},
};

type Middleware = Arc<dyn Fn(&Arc<Socket>) -> Result<(), MiddlewareError> + Send + Sync>;
type ConnectListener = Arc<dyn Fn(&Arc<Socket>) + Send + Sync>;

/// Handle returned when registering a listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Create a listener id from its raw value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value.
    pub fn get(self) -> u64 {
        self.0
    }
}

struct Listener {
    id: ListenerId,
    once: bool,
    callback: ConnectListener,
}

struct AdapterBinding {
    name: String,
    adapter: Box<dyn Adapter>,
}

/// A named channel of connected sockets.
pub struct Namespace {
    name: String,
    encoder: Arc<dyn Encoder>,
    sockets: RwLock<Vec<Arc<Socket>>>,
    middleware: RwLock<Vec<Middleware>>,
    listeners: Mutex<Vec<Listener>>,
    next_listener: AtomicU64,
    binding: RwLock<AdapterBinding>,
    adapter_inits: AtomicU64,
}

impl Namespace {
    /// Create a namespace and initialize its adapter from `factory`.
    ///
    /// `name` must already be canonical (start with `/`).
    pub fn new(
        name: impl Into<String>,
        encoder: Arc<dyn Encoder>,
        factory: &dyn AdapterFactory,
    ) -> Arc<Self> {
        let name = name.into();
        let binding =
            AdapterBinding { name: factory.name().to_string(), adapter: factory.create(&name) };

        Arc::new(Self {
            name,
            encoder,
            sockets: RwLock::new(Vec::new()),
            middleware: RwLock::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            binding: RwLock::new(binding),
            adapter_inits: AtomicU64::new(1),
        })
    }

    /// Namespace name, always starting with `/`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encoder shared by every socket of this namespace.
    pub fn encoder(&self) -> &Arc<dyn Encoder> {
        &self.encoder
    }

    /// Replace the adapter with a fresh one from `factory`.
    ///
    /// Room memberships of currently connected sockets are carried over, so
    /// the swap is invisible to them.
    pub fn init_adapter(&self, factory: &dyn AdapterFactory) {
        let fresh = factory.create(&self.name);

        let sockets = self.sockets.read();
        let mut binding = self.binding.write();

        for socket in sockets.iter() {
            for room in binding.adapter.rooms_of(socket.id()) {
                fresh.add(socket.id(), &room);
            }
        }

        binding.adapter = fresh;
        binding.name = factory.name().to_string();
        self.adapter_inits.fetch_add(1, Ordering::AcqRel);

        debug!(nsp = %self.name, adapter = %binding.name, "adapter initialized");
    }

    /// Name of the current adapter kind.
    pub fn adapter_name(&self) -> String {
        self.binding.read().name.clone()
    }

    /// How many times an adapter has been initialized for this namespace,
    /// including the one at creation.
    pub fn adapter_inits(&self) -> u64 {
        self.adapter_inits.load(Ordering::Acquire)
    }

    /// Run `f` against the current adapter.
    pub fn with_adapter<R>(&self, f: impl FnOnce(&dyn Adapter) -> R) -> R {
        f(self.binding.read().adapter.as_ref())
    }

    /// Append a middleware to the connect chain.
    ///
    /// Middleware run in registration order; the first error rejects the
    /// connection.
    pub fn use_middleware<F>(&self, middleware: F) -> &Self
    where
        F: Fn(&Arc<Socket>) -> Result<(), MiddlewareError> + Send + Sync + 'static,
    {
        self.middleware.write().push(Arc::new(middleware));
        self
    }

    /// Whether any middleware is installed.
    pub fn has_middleware(&self) -> bool {
        !self.middleware.read().is_empty()
    }

    /// Call `listener` for every socket that joins this namespace.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Arc<Socket>) + Send + Sync + 'static,
    {
        self.add_listener(false, Arc::new(listener))
    }

    /// Call `listener` for the next socket that joins, then drop it.
    pub fn once<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Arc<Socket>) + Send + Sync + 'static,
    {
        self.add_listener(true, Arc::new(listener))
    }

    /// Remove a connection listener. Returns whether it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    fn add_listener(&self, once: bool, callback: ConnectListener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push(Listener { id, once, callback });
        id
    }

    /// Admit a client into this namespace.
    ///
    /// Runs the middleware chain, registers the socket, joins it to the room
    /// named after its id, confirms the join to the client and notifies
    /// connection listeners. The confirmation is skipped for `/` without
    /// middleware because it already travelled with the transport handshake.
    ///
    /// # Errors
    ///
    /// - `ConnectError::Rejected` if a middleware refused; the client was sent
    ///   a `ConnectError` packet and the socket was never registered
    /// - `ConnectError::Socket` if the confirmation could not be written
    pub fn add(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        handshake: Arc<Handshake>,
    ) -> Result<Arc<Socket>, ConnectError> {
        let id = if self.name == DEFAULT_NAMESPACE {
            transport.id().to_string()
        } else {
            format!("{}#{}", self.name, transport.id())
        };
        let socket = Arc::new(Socket::new(id, Arc::clone(self), transport, handshake));

        let chain = self.middleware.read().clone();
        for middleware in &chain {
            if let Err(err) = middleware(&socket) {
                debug!(nsp = %self.name, sid = %socket.id(), error = %err, "connection rejected");
                self.reject(&socket, &err);
                return Err(ConnectError::Rejected(err));
            }
        }

        self.sockets.write().push(Arc::clone(&socket));
        self.with_adapter(|adapter| adapter.add(socket.id(), socket.id()));

        if self.name != DEFAULT_NAMESPACE || !chain.is_empty() {
            let confirm = Packet::connect_with(self.name.clone(), json!({ "sid": socket.id() }));
            if let Err(err) = socket.packet(confirm) {
                socket.on_close("transport error");
                return Err(err.into());
            }
        }

        debug!(nsp = %self.name, sid = %socket.id(), "socket connected");
        self.notify(&socket);

        Ok(socket)
    }

    fn reject(&self, socket: &Socket, err: &MiddlewareError) {
        let mut packet = Packet::connect_error(self.name.clone(), err.message());
        if let (Some(extra), Some(Value::Object(body))) = (err.data(), packet.data.as_mut()) {
            body.insert("data".to_string(), extra.clone());
        }

        // The socket is not connected to anything yet, so write directly
        match self.encoder.encode(&packet) {
            Ok(encoded) => {
                if let Err(err) = socket.send_raw(encoded) {
                    debug!(sid = %socket.id(), error = %err, "connect error not delivered");
                }
            },
            Err(err) => warn!(nsp = %self.name, error = %err, "failed to encode connect error"),
        }
    }

    fn notify(&self, socket: &Arc<Socket>) {
        let callbacks: Vec<ConnectListener> = {
            let mut listeners = self.listeners.lock();
            let callbacks = listeners.iter().map(|l| Arc::clone(&l.callback)).collect();
            listeners.retain(|l| !l.once);
            callbacks
        };

        for callback in callbacks {
            callback(socket);
        }
    }

    /// Deregister a socket and drop its room memberships.
    pub(crate) fn remove(&self, id: &str) {
        self.sockets.write().retain(|s| s.id() != id);
        self.with_adapter(|adapter| adapter.del_all(id));
        trace!(nsp = %self.name, sid = id, "socket removed");
    }

    /// Snapshot of connected sockets, in connection order.
    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.sockets.read().clone()
    }

    /// Look up a connected socket by id.
    pub fn socket(&self, id: &str) -> Option<Arc<Socket>> {
        self.sockets.read().iter().find(|s| s.id() == id).cloned()
    }

    /// Number of connected sockets.
    pub fn len(&self) -> usize {
        self.sockets.read().len()
    }

    /// Whether no socket is connected.
    pub fn is_empty(&self) -> bool {
        self.sockets.read().is_empty()
    }

    /// Start a broadcast to a room.
    pub fn to(self: &Arc<Self>, room: &str) -> BroadcastOperator {
        BroadcastOperator::new(Arc::clone(self)).to(room)
    }

    /// Alias of [`Namespace::to`].
    pub fn in_room(self: &Arc<Self>, room: &str) -> BroadcastOperator {
        self.to(room)
    }

    /// Start a broadcast that skips a socket.
    pub fn except(self: &Arc<Self>, id: &str) -> BroadcastOperator {
        BroadcastOperator::new(Arc::clone(self)).except(id)
    }

    /// Start a broadcast with the compression hint set.
    pub fn compress(self: &Arc<Self>, compress: bool) -> BroadcastOperator {
        BroadcastOperator::new(Arc::clone(self)).compress(compress)
    }

    /// Emit an event to every connected socket.
    pub fn emit(self: &Arc<Self>, event: &str, args: Vec<Value>) -> Result<usize, BroadcastError> {
        BroadcastOperator::new(Arc::clone(self)).emit(event, args)
    }

    /// Emit a `message` event to every connected socket.
    pub fn send(self: &Arc<Self>, args: Vec<Value>) -> Result<usize, BroadcastError> {
        self.emit("message", args)
    }

    /// Alias of [`Namespace::send`].
    pub fn write(self: &Arc<Self>, args: Vec<Value>) -> Result<usize, BroadcastError> {
        self.send(args)
    }

    /// Ids of every connected socket.
    pub fn clients(self: &Arc<Self>) -> Vec<SocketId> {
        BroadcastOperator::new(Arc::clone(self)).clients()
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("sockets", &self.len())
            .field("adapter", &self.adapter_name())
            .finish_non_exhaustive()
    }
}

/// Builder for a broadcast: selects rooms and exclusions, then emits.
#[derive(Debug, Clone)]
pub struct BroadcastOperator {
    nsp: Arc<Namespace>,
    opts: BroadcastOptions,
}

impl BroadcastOperator {
    /// Broadcast to every socket of `nsp`.
    pub fn new(nsp: Arc<Namespace>) -> Self {
        Self { nsp, opts: BroadcastOptions::default() }
    }

    /// Add a target room.
    pub fn to(mut self, room: &str) -> Self {
        self.opts.rooms.insert(room.to_string());
        self
    }

    /// Alias of [`BroadcastOperator::to`].
    pub fn in_room(self, room: &str) -> Self {
        self.to(room)
    }

    /// Skip a socket.
    pub fn except(mut self, id: &str) -> Self {
        self.opts.except.insert(id.to_string());
        self
    }

    /// Set the compression hint.
    pub fn compress(mut self, compress: bool) -> Self {
        self.opts.compress = compress;
        self
    }

    /// Selected rooms.
    pub fn rooms(&self) -> &BTreeSet<String> {
        &self.opts.rooms
    }

    /// Emit an event to the selected sockets.
    ///
    /// The packet is encoded once. Returns how many sockets it was written
    /// to; failed writes are logged and skipped.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<usize, BroadcastError> {
        let packet = Packet::event(self.nsp.name(), event, args);
        let targets =
            self.nsp.with_adapter(|adapter| adapter.broadcast_targets(&packet, &self.opts))?;
        let encoded = self.nsp.encoder().encode(&packet)?;

        let sockets = self.nsp.sockets();
        let by_id: HashMap<&str, &Arc<Socket>> = sockets.iter().map(|s| (s.id(), s)).collect();

        let mut delivered = 0;
        for target in &targets {
            let Some(socket) = by_id.get(target.as_str()) else {
                continue;
            };
            match socket.send_raw(encoded.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(nsp = %self.nsp.name(), sid = %target, error = %err, "broadcast write failed");
                },
            }
        }

        trace!(nsp = %self.nsp.name(), event, delivered, "broadcast");
        Ok(delivered)
    }

    /// Emit a `message` event to the selected sockets.
    pub fn send(&self, args: Vec<Value>) -> Result<usize, BroadcastError> {
        self.emit("message", args)
    }

    /// Alias of [`BroadcastOperator::send`].
    pub fn write(&self, args: Vec<Value>) -> Result<usize, BroadcastError> {
        self.send(args)
    }

    /// Ids of the selected sockets.
    pub fn clients(&self) -> Vec<SocketId> {
        let mut ids = self.nsp.with_adapter(|adapter| adapter.sockets(&self.opts.rooms));
        ids.retain(|id| !self.opts.except.contains(id));
        ids
    }
}
