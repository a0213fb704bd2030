//! Switchboard core.
//!
//! The pieces the server coordinator drives but does not own:
//!
//! - [`Transport`] / [`RawConnection`]: the narrow view of one transport
//!   connection handed over by an engine
//! - [`session::Session`]: pure engine-session state machine (open handshake,
//!   heartbeats, timeouts) using the action pattern
//! - [`Client`]: one per transport connection, routes packets to sockets
//! - [`Namespace`] / [`Socket`]: logical channels and their members
//! - [`Adapter`]: room membership and fan-out backend, [`MemoryAdapter`] by
//!   default
//! - [`NamespaceRegistry`]: insertion-ordered name → namespace map
//!
//! Everything here is synchronous. Methods that need time take it as a
//! parameter; I/O happens only through the [`Transport`] trait.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
mod client;
mod error;
mod namespace;
mod registry;
pub mod session;
mod socket;
mod transport;

pub use adapter::{
    Adapter, AdapterFactory, BroadcastOptions, DEFAULT_ADAPTER, MemoryAdapter, MemoryAdapterFactory,
    Room, SocketId,
};
pub use client::{Client, TRANSPORT_CLOSE};
pub use error::{
    AdapterError, BroadcastError, ConnectError, MiddlewareError, SessionError, SocketError,
};
pub use namespace::{BroadcastOperator, ListenerId, Namespace};
pub use registry::NamespaceRegistry;
pub use socket::{AckSender, CLIENT_DISCONNECT, SERVER_DISCONNECT, Socket};
pub use transport::{Handshake, RawConnection, Transport};
