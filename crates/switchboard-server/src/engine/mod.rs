//! Transport engines.
//!
//! An engine owns raw connections: it runs admission, performs the transport
//! handshake, drives each connection's [`Session`] and hands accepted
//! connections to its listener as a [`RawConnection`]. The coordinator only
//! talks to engines through the [`Engine`] trait.
//!
//! - [`WsEngine`]: WebSocket over a TCP [`crate::Endpoint`]
//! - [`MemoryEngine`]: in-process, for deterministic tests
//!
//! [`Session`]: switchboard_core::session::Session

mod memory;
mod ws;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

pub use memory::{MemoryEngine, MemoryPeer};
use parking_lot::{Mutex, RwLock};
use switchboard_core::{
    Handshake, ListenerId, RawConnection,
    session::{DEFAULT_MAX_PAYLOAD, DEFAULT_PING_INTERVAL, DEFAULT_PING_TIMEOUT, SessionConfig},
};
use tracing::{debug, warn};
pub use ws::WsEngine;

use crate::error::ServerError;

/// Transport name served by [`WsEngine`].
pub const WEBSOCKET: &str = "websocket";

/// Admission callback run before a connection is created.
pub type AllowRequest = Arc<dyn Fn(&Handshake) -> bool + Send + Sync>;

/// Receives every accepted connection.
pub type ConnectionListener = Arc<dyn Fn(RawConnection) + Send + Sync>;

/// Options an engine is attached with.
#[derive(Clone)]
pub struct EngineOptions {
    /// Handshake path, without trailing slash
    pub path: String,
    /// Admission callback; `None` admits everything
    pub allow_request: Option<AllowRequest>,
    /// Pre-encoded packet sent right after the open handshake
    pub initial_packet: Option<String>,
    /// Allowed transports
    pub transports: Vec<String>,
    /// Interval between pings
    pub ping_interval: Duration,
    /// Time allowed for a pong
    pub ping_timeout: Duration,
    /// Largest accepted inbound message in bytes
    pub max_http_buffer_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            path: crate::config::DEFAULT_PATH.to_string(),
            allow_request: None,
            initial_packet: None,
            transports: vec![WEBSOCKET.to_string()],
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            max_http_buffer_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl EngineOptions {
    /// Session configuration derived from these options.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ping_interval: self.ping_interval,
            ping_timeout: self.ping_timeout,
            max_payload: self.max_http_buffer_size,
            upgrades: Vec::new(),
        }
    }

    /// Run the admission callback.
    pub fn admits(&self, handshake: &Handshake) -> bool {
        self.allow_request.as_ref().is_none_or(|allow| allow(handshake))
    }

    /// Whether `transport` is allowed.
    pub fn allows_transport(&self, transport: &str) -> bool {
        self.transports.iter().any(|t| t == transport)
    }

    /// Apply a live option change.
    pub fn apply(&mut self, option: EngineOption) {
        match option {
            EngineOption::Transports(transports) => self.transports = transports,
            EngineOption::PingTimeout(timeout) => self.ping_timeout = timeout,
            EngineOption::PingInterval(interval) => self.ping_interval = interval,
            EngineOption::MaxHttpBufferSize(size) => self.max_http_buffer_size = size,
        }
    }
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("path", &self.path)
            .field("allow_request", &self.allow_request.is_some())
            .field("initial_packet", &self.initial_packet)
            .field("transports", &self.transports)
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("max_http_buffer_size", &self.max_http_buffer_size)
            .finish()
    }
}

/// Engine option that can change while the engine runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOption {
    /// `transports`
    Transports(Vec<String>),
    /// `pingTimeout`
    PingTimeout(Duration),
    /// `pingInterval`
    PingInterval(Duration),
    /// `maxHttpBufferSize`
    MaxHttpBufferSize(usize),
}

impl EngineOption {
    /// Option name as engines know it.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Transports(_) => "transports",
            Self::PingTimeout(_) => "pingTimeout",
            Self::PingInterval(_) => "pingInterval",
            Self::MaxHttpBufferSize(_) => "maxHttpBufferSize",
        }
    }
}

/// A transport engine as seen by the coordinator.
pub trait Engine: Send + Sync {
    /// Subscribe to accepted connections.
    ///
    /// Connections go to the most recently added listener still registered.
    fn on_connection(&self, listener: ConnectionListener) -> ListenerId;

    /// Unsubscribe. Returns whether the listener was registered.
    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Change a live option. Returns false if this engine does not support
    /// the option.
    fn set_option(&self, option: EngineOption) -> bool;

    /// Snapshot of the current options.
    fn options(&self) -> EngineOptions;

    /// Close every connection and stop accepting new ones. Idempotent.
    fn close(&self);

    /// Number of open connections.
    fn clients_count(&self) -> usize;
}

/// Listener registry and live options shared by engine implementations.
pub(crate) struct EngineCore {
    options: RwLock<EngineOptions>,
    listeners: Mutex<Vec<(ListenerId, ConnectionListener)>>,
    next_listener: AtomicU64,
}

impl EngineCore {
    pub(crate) fn new(options: EngineOptions) -> Self {
        Self {
            options: RwLock::new(options),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        }
    }

    pub(crate) fn options(&self) -> EngineOptions {
        self.options.read().clone()
    }

    pub(crate) fn set_option(&self, option: EngineOption) {
        debug!(option = option.name(), "engine option changed");
        self.options.write().apply(option);
    }

    pub(crate) fn add_listener(&self, listener: ConnectionListener) -> ListenerId {
        let id = ListenerId::new(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    /// Hand a connection to the newest listener. Returns false if nobody
    /// listens, in which case the connection is dropped.
    pub(crate) fn emit(&self, conn: RawConnection) -> bool {
        let listener = self.listeners.lock().last().map(|(_, l)| Arc::clone(l));
        match listener {
            Some(listener) => {
                listener(conn);
                true
            },
            None => {
                warn!(sid = %conn.id(), "no connection listener, dropping");
                conn.transport.close();
                false
            },
        }
    }
}

/// Generate a fresh session id from OS randomness.
pub(crate) fn generate_sid() -> Result<String, ServerError> {
    let mut bytes = [0u8; 15];
    getrandom::fill(&mut bytes)
        .map_err(|e| ServerError::Internal(format!("OS RNG failure: {e}")))?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}
