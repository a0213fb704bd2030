//! The coordinator.
//!
//! [`Server`] owns the namespace registry, the origin policy, the handshake
//! path and adapter binding, and the attach/bind/close lifecycle. Every
//! accepted connection is wrapped in a [`Client`] and joined to `/` before
//! the connection's own task takes over.
//!
//! # Lifecycle
//!
//! ```text
//! Unattached ──attach──▶ Attaching ──bound──▶ Ready ──close──▶ Closing ──▶ Closed
//!      ▲                    │                                               │
//!      └───bind failure─────┘                  attach again ◀───────────────┘
//! ```
//!
//! # Invariants
//!
//! - `ready()` resolves true only once the endpoint is recorded, so `port()`
//!   is never `None` while ready.
//! - Namespaces are only created through [`Server::of`].
//! - An adapter change has re-initialized every registered namespace when
//!   [`Server::set_adapter`] returns.
//! - `close()` tells sockets before tearing down the engine, and the engine
//!   before the endpoint.

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use switchboard_core::{
    AdapterFactory, BroadcastError, BroadcastOperator, Client, Handshake, ListenerId,
    MemoryAdapterFactory, MiddlewareError, Namespace, NamespaceRegistry, RawConnection, Socket, SocketId,
};
use switchboard_proto::{DEFAULT_NAMESPACE, Decoder, Encoder, Packet, TextCodec};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    config::{AttachOptions, ServerConfig, normalize_path},
    endpoint::Endpoint,
    engine::{AllowRequest, ConnectionListener, Engine, EngineOptions, WsEngine},
    error::ServerError,
    legacy::{AuthorizationHook, LegacyKey, SettingValue},
    origin::OriginPolicy,
};

/// Reason given to sockets closed by [`Server::close`].
pub const SERVER_SHUTDOWN: &str = "server shutting down";

/// Attach lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Never attached, or the last attach failed
    Unattached,
    /// Attach in progress
    Attaching,
    /// Accepting connections
    Ready,
    /// Close in progress
    Closing,
    /// Closed; may attach again
    Closed,
}

struct Binding {
    engine: Arc<dyn Engine>,
    listener: ListenerId,
}

struct Inner {
    config: RwLock<ServerConfig>,
    codec: Arc<TextCodec>,
    registry: Arc<NamespaceRegistry>,
    binding: RwLock<Option<Binding>>,
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    state: watch::Sender<Lifecycle>,
}

/// Connection admission and namespace coordinator.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Server with default configuration and the in-memory adapter.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Server with `config`.
    pub fn with_config(mut config: ServerConfig) -> Self {
        config.path = normalize_path(&config.path);
        let codec = Arc::new(TextCodec);
        let encoder: Arc<dyn Encoder> = Arc::clone(&codec) as Arc<dyn Encoder>;
        let registry = Arc::new(NamespaceRegistry::new(encoder, Arc::new(MemoryAdapterFactory)));
        let (state, _) = watch::channel(Lifecycle::Unattached);

        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                codec,
                registry,
                binding: RwLock::new(None),
                endpoint: Mutex::new(None),
                state,
            }),
        }
    }

    // Configuration

    /// Handshake path.
    pub fn path(&self) -> String {
        self.inner.config.read().path.clone()
    }

    /// Set the handshake path; one trailing slash is stripped. Applies to the
    /// next attach.
    pub fn set_path(&self, path: &str) -> &Self {
        self.inner.config.write().path = normalize_path(path);
        self
    }

    /// Current origin policy.
    pub fn origins(&self) -> OriginPolicy {
        self.inner.config.read().origins.clone()
    }

    /// Replace the origin policy. Admission reads it per request.
    pub fn set_origins(&self, origins: impl Into<OriginPolicy>) -> &Self {
        let origins = origins.into();
        debug!(?origins, "origin policy changed");
        self.inner.config.write().origins = origins;
        self
    }

    /// Adapter factory every namespace is bound to.
    pub fn adapter(&self) -> Arc<dyn AdapterFactory> {
        self.inner.registry.adapter()
    }

    /// Name of the bound adapter.
    pub fn adapter_name(&self) -> String {
        self.inner.registry.adapter_name()
    }

    /// Bind a new adapter and re-initialize every registered namespace
    /// against it before returning.
    pub fn set_adapter(&self, factory: Arc<dyn AdapterFactory>) -> &Self {
        self.inner.registry.reinit_adapters(factory);
        self
    }

    /// Whether the client bundle would be served.
    pub fn serve_client(&self) -> bool {
        self.inner.config.read().serve_client
    }

    /// Record whether the client bundle should be served.
    pub fn set_serve_client(&self, serve: bool) -> &Self {
        self.inner.config.write().serve_client = serve;
        self
    }

    /// Snapshot of the configuration.
    pub fn config(&self) -> ServerConfig {
        self.inner.config.read().clone()
    }

    /// Legacy `set(key, value)` entry point.
    ///
    /// - `authorization`: install an authorization middleware on `/`
    /// - `origins`: same as [`Server::set_origins`]
    /// - `resource`: same as [`Server::set_path`]
    /// - a translated legacy key: forwarded to the bound engine's option
    /// - anything else is ignored
    pub fn set(&self, key: &str, value: impl Into<SettingValue>) -> &Self {
        let value = value.into();
        match (key, value) {
            ("authorization", SettingValue::Authorization(hook)) => self.authorize(hook),
            ("origins", SettingValue::Origins(policy)) => self.set_origins(policy),
            ("origins", SettingValue::Text(patterns)) => self.set_origins(OriginPolicy::parse(&patterns)),
            ("origins", SettingValue::List(patterns)) => self.set_origins(OriginPolicy::patterns(patterns)),
            ("resource", SettingValue::Text(path)) => self.set_path(&path),
            (key, value) => match LegacyKey::lookup(key) {
                Some(legacy) => self.forward(legacy, &value),
                None => {
                    debug!(key, ?value, "ignoring setting");
                    self
                },
            },
        }
    }

    fn authorize(&self, hook: AuthorizationHook) -> &Self {
        self.sockets().use_middleware(move |socket| match hook(socket.handshake()) {
            Ok(true) => Ok(()),
            Ok(false) => Err(MiddlewareError::new("Not authorized")),
            Err(reason) => Err(MiddlewareError::new(reason)),
        });
        self
    }

    fn forward(&self, key: LegacyKey, value: &SettingValue) -> &Self {
        let Some(engine) = self.engine() else {
            debug!(key = key.name(), "no engine bound, legacy setting dropped");
            return self;
        };
        let Some(option) = key.option(value) else {
            debug!(key = key.name(), ?value, "legacy setting has the wrong shape");
            return self;
        };
        if engine.set_option(option) {
            debug!(key = key.name(), target = key.target(), "legacy setting forwarded");
        } else {
            debug!(key = key.name(), target = key.target(), "engine has no such option");
        }
        self
    }

    // Namespaces

    /// The namespace `name`, created on first reference.
    pub fn of(&self, name: &str) -> Arc<Namespace> {
        let (nsp, created) = self.inner.registry.get_or_create(name);
        if created {
            info!(nsp = %nsp.name(), "namespace created");
        }
        nsp
    }

    /// [`Server::of`], subscribing `on_connect` to the namespace's connections.
    pub fn of_with<F>(&self, name: &str, on_connect: F) -> Arc<Namespace>
    where
        F: Fn(&Arc<Socket>) + Send + Sync + 'static,
    {
        let nsp = self.of(name);
        nsp.on(on_connect);
        nsp
    }

    /// The default namespace `/`.
    pub fn sockets(&self) -> Arc<Namespace> {
        Arc::clone(self.inner.registry.default_namespace())
    }

    /// The namespace registry.
    pub fn registry(&self) -> &Arc<NamespaceRegistry> {
        &self.inner.registry
    }

    // Lifecycle

    /// Bind a listening endpoint and start accepting connections.
    ///
    /// Unless `/` has middleware, the connect packet for `/` is encoded up
    /// front and sent with the transport handshake. Admission always runs the
    /// origin policy.
    ///
    /// # Errors
    ///
    /// - `ServerError::Transport` if the endpoint cannot be bound
    /// - `ServerError::Protocol` if the initial packet cannot be encoded
    ///
    /// On error the server is left [`Lifecycle::Unattached`], or still
    /// [`Lifecycle::Ready`] on its previous endpoint if it was attached.
    pub async fn attach(&self, options: impl Into<AttachOptions>) -> Result<(), ServerError> {
        let options = options.into();
        self.inner.state.send_replace(Lifecycle::Attaching);

        match self.try_attach(options).await {
            Ok(addr) => {
                self.inner.state.send_replace(Lifecycle::Ready);
                info!(%addr, path = %self.path(), "server ready");
                Ok(())
            },
            Err(e) => {
                // A failed re-attach leaves the previous endpoint serving
                let state = if self.local_addr().is_some() {
                    Lifecycle::Ready
                } else {
                    Lifecycle::Unattached
                };
                warn!(error = %e, ?state, "attach failed");
                self.inner.state.send_replace(state);
                Err(e)
            },
        }
    }

    /// Alias of [`Server::attach`].
    ///
    /// # Errors
    ///
    /// Same as [`Server::attach`].
    pub async fn listen(&self, options: impl Into<AttachOptions>) -> Result<(), ServerError> {
        self.attach(options).await
    }

    async fn try_attach(&self, options: AttachOptions) -> Result<SocketAddr, ServerError> {
        let (addr, base) = {
            let config = self.inner.config.read();
            let engine = options.engine.clone().unwrap_or_else(|| config.engine.clone());
            (config.bind_address(&options), engine)
        };

        let engine = WsEngine::new(self.finish_engine_options(base)?);
        let endpoint = Arc::new(Endpoint::bind(&addr, engine.clone()).await?);
        let local_addr = endpoint.local_addr();

        let previous = self.inner.endpoint.lock().replace(endpoint);
        if let Some(previous) = previous {
            debug!(addr = %previous.local_addr(), "replacing endpoint");
            previous.close().await;
        }

        self.bind(Arc::new(engine));
        Ok(local_addr)
    }

    /// Options an engine is attached with: the configured engine options
    /// plus this server's path, admission callback and initial packet.
    ///
    /// # Errors
    ///
    /// - `ServerError::Protocol` if the initial packet cannot be encoded
    pub fn engine_options(&self) -> Result<EngineOptions, ServerError> {
        let base = self.inner.config.read().engine.clone();
        self.finish_engine_options(base)
    }

    fn finish_engine_options(&self, mut options: EngineOptions) -> Result<EngineOptions, ServerError> {
        options.path = self.path();
        options.allow_request = Some(self.admission());

        // Middleware on `/` must run before the client is told it joined
        options.initial_packet = if self.sockets().has_middleware() {
            None
        } else {
            Some(self.inner.codec.encode(&Packet::connect(DEFAULT_NAMESPACE))?)
        };
        Ok(options)
    }

    /// Admission callback handed to engines: the origin policy, read live.
    fn admission(&self) -> AllowRequest {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |handshake: &Handshake| {
            inner.upgrade().is_some_and(|inner| inner.config.read().origins.check_request(handshake))
        })
    }

    /// Start acting on `engine`'s connections.
    ///
    /// A previously bound engine is unsubscribed but left running.
    pub fn bind(&self, engine: Arc<dyn Engine>) -> &Self {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let listener: ConnectionListener = Arc::new(move |conn: RawConnection| {
            if let Some(inner) = weak.upgrade() {
                Self { inner }.on_connection(conn);
            }
        });

        let id = engine.on_connection(listener);
        let previous = self.inner.binding.write().replace(Binding { engine, listener: id });
        if let Some(previous) = previous {
            previous.engine.remove_listener(previous.listener);
            debug!("previous engine unbound");
        }
        self
    }

    /// Wrap an accepted connection in a [`Client`] and join it to `/`.
    ///
    /// Rejections are the client's concern, so this never fails. The
    /// connection's inbound stream is consumed on a spawned task.
    pub fn on_connection(&self, conn: RawConnection) {
        let RawConnection { transport, handshake, incoming } = conn;
        let client = Client::new(
            transport,
            handshake,
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.codec) as Arc<dyn Decoder>,
        );

        if let Err(e) = client.connect(DEFAULT_NAMESPACE) {
            debug!(sid = %client.id(), error = %e, "default namespace refused connection");
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(client.run(incoming));
            },
            Err(_) => {
                warn!(sid = %client.id(), "no runtime to drive connection");
                client.disconnect();
            },
        }
    }

    /// Close every default-namespace socket, then the engine, then the
    /// endpoint. Safe to call repeatedly.
    pub async fn close(&self) {
        self.inner.state.send_replace(Lifecycle::Closing);

        let sockets = self.sockets().sockets();
        let closed = sockets.len();
        for socket in sockets {
            socket.on_close(SERVER_SHUTDOWN);
        }

        let binding = self.inner.binding.write().take();
        if let Some(binding) = &binding {
            binding.engine.remove_listener(binding.listener);
            binding.engine.close();
        }

        let endpoint = self.inner.endpoint.lock().take();
        if let Some(endpoint) = &endpoint {
            endpoint.close().await;
        }

        self.inner.state.send_replace(Lifecycle::Closed);
        if binding.is_some() || endpoint.is_some() || closed > 0 {
            info!(sockets = closed, "server closed");
        }
    }

    // Status

    /// Wait for an attach in progress, then report whether the server is
    /// accepting connections.
    pub async fn ready(&self) -> bool {
        let mut state = self.inner.state.subscribe();
        let settled = state
            .wait_for(|s| !matches!(s, Lifecycle::Attaching | Lifecycle::Closing))
            .await
            .map(|s| *s);
        matches!(settled, Ok(Lifecycle::Ready))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Lifecycle {
        *self.inner.state.borrow()
    }

    /// Bound port, `None` until attached.
    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// Bound address, `None` until attached.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoint.lock().as_ref().map(|e| e.local_addr())
    }

    /// The bound engine, if any.
    pub fn engine(&self) -> Option<Arc<dyn Engine>> {
        self.inner.binding.read().as_ref().map(|b| Arc::clone(&b.engine))
    }

    // Default namespace

    /// Broadcast `event` on `/`.
    ///
    /// # Errors
    ///
    /// - `BroadcastError` if the packet cannot be encoded or the adapter fails
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<usize, BroadcastError> {
        self.sockets().emit(event, args)
    }

    /// Subscribe to connections on `/`.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Arc<Socket>) + Send + Sync + 'static,
    {
        self.sockets().on(listener)
    }

    /// Subscribe to the next connection on `/`.
    pub fn once<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Arc<Socket>) + Send + Sync + 'static,
    {
        self.sockets().once(listener)
    }

    /// Remove a connection listener from `/`.
    pub fn off(&self, id: ListenerId) -> bool {
        self.sockets().off(id)
    }

    /// Target a room on `/`.
    pub fn to(&self, room: &str) -> BroadcastOperator {
        self.sockets().to(room)
    }

    /// Alias of [`Server::to`].
    pub fn in_room(&self, room: &str) -> BroadcastOperator {
        self.sockets().in_room(room)
    }

    /// Append a middleware to `/`.
    pub fn use_middleware<F>(&self, middleware: F) -> &Self
    where
        F: Fn(&Arc<Socket>) -> Result<(), MiddlewareError> + Send + Sync + 'static,
    {
        self.sockets().use_middleware(middleware);
        self
    }

    /// Broadcast a `message` event on `/`.
    ///
    /// # Errors
    ///
    /// Same as [`Server::emit`].
    pub fn send(&self, args: Vec<Value>) -> Result<usize, BroadcastError> {
        self.sockets().send(args)
    }

    /// Alias of [`Server::send`].
    ///
    /// # Errors
    ///
    /// Same as [`Server::emit`].
    pub fn write(&self, args: Vec<Value>) -> Result<usize, BroadcastError> {
        self.sockets().write(args)
    }

    /// Ids of every socket on `/`.
    pub fn clients(&self) -> Vec<SocketId> {
        self.sockets().clients()
    }

    /// Broadcast on `/` with the compression flag set.
    pub fn compress(&self, compress: bool) -> BroadcastOperator {
        self.sockets().compress(compress)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state())
            .field("path", &self.path())
            .field("local_addr", &self.local_addr())
            .field("namespaces", &self.inner.registry.names())
            .finish_non_exhaustive()
    }
}
