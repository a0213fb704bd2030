//! Switchboard server.
//!
//! The connection admission and namespace coordination layer of a real-time
//! event server, with a WebSocket engine over tokio.
//!
//! # Architecture
//!
//! [`switchboard_core`] holds the collaborators (namespaces, sockets, clients,
//! adapters and the pure engine-session state machine). This crate adds the
//! coordinator that wires them to a transport: [`Server`] admits connections
//! under an [`OriginPolicy`], merges the default-namespace connect packet into
//! the transport handshake, routes each connection into `/`, and owns the
//! attach/close lifecycle.
//!
//! # Components
//!
//! - [`Server`]: coordinator and default-namespace facade
//! - [`OriginPolicy`]: cross-origin admission
//! - [`Engine`]: transport engine seam, with [`WsEngine`] and [`MemoryEngine`]
//! - [`Endpoint`]: bound TCP listener feeding the WebSocket engine
//! - [`SettingValue`] / [`LegacyKey`]: legacy `set(key, value)` surface

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod endpoint;
pub mod engine;
mod error;
mod legacy;
mod origin;
mod server;

pub use config::{AttachOptions, DEFAULT_HOST, DEFAULT_PATH, ServerConfig, normalize_path};
pub use endpoint::Endpoint;
pub use engine::{
    AllowRequest, ConnectionListener, Engine, EngineOption, EngineOptions, MemoryEngine, MemoryPeer,
    WEBSOCKET, WsEngine,
};
pub use error::{AdmissionError, ServerError};
pub use legacy::{AuthorizationHook, LegacyKey, SettingValue};
pub use origin::{OriginPolicy, OriginPredicate, WILDCARD, request_origin};
pub use server::{Lifecycle, SERVER_SHUTDOWN, Server};
