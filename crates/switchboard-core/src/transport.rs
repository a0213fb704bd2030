//! Narrow view of one transport connection.
//!
//! Engines own the actual duplex I/O. What crosses into the core is a
//! [`RawConnection`]: a [`Transport`] handle for writing, the request metadata
//! captured at upgrade time, and a channel of inbound application messages.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use tokio::sync::mpsc;

use crate::error::SocketError;

/// Write side of a transport connection.
///
/// Implementations are cheap to share and safe to call from any task.
pub trait Transport: Send + Sync + 'static {
    /// Engine session id.
    fn id(&self) -> &str;

    /// Queue one encoded namespace packet for delivery.
    ///
    /// The engine wraps it in its own message framing.
    fn send(&self, message: String) -> Result<(), SocketError>;

    /// Close the connection. Idempotent.
    ///
    /// The inbound channel of the matching [`RawConnection`] ends once the
    /// engine has torn the connection down.
    fn close(&self);

    /// Whether the connection is still open.
    fn is_open(&self) -> bool;
}

/// Request metadata captured when the connection was upgraded.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Request target (path and query)
    pub url: String,
    /// Request headers, names lowercased
    pub headers: HashMap<String, String>,
    /// Decoded query parameters
    pub query: HashMap<String, String>,
    /// Peer address, if known
    pub remote_addr: Option<SocketAddr>,
}

impl Handshake {
    /// Create handshake metadata for a request target.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    /// Add a header (name is lowercased).
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Add a query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Set the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Header value, looked up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Query parameter value.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

/// An accepted connection as handed over by an engine.
pub struct RawConnection {
    /// Write side
    pub transport: Arc<dyn Transport>,
    /// Request metadata
    pub handshake: Handshake,
    /// Inbound application messages (already stripped of engine framing)
    pub incoming: mpsc::UnboundedReceiver<String>,
}

impl RawConnection {
    /// Bundle the parts of an accepted connection.
    pub fn new(
        transport: Arc<dyn Transport>,
        handshake: Handshake,
        incoming: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self { transport, handshake, incoming }
    }

    /// Engine session id.
    pub fn id(&self) -> &str {
        self.transport.id()
    }
}

impl std::fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConnection")
            .field("id", &self.transport.id())
            .field("url", &self.handshake.url)
            .finish_non_exhaustive()
    }
}
