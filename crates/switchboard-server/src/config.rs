//! Server configuration.

use crate::{engine::EngineOptions, origin::OriginPolicy};

/// Default handshake path.
pub const DEFAULT_PATH: &str = "/socket.io";

/// Default bind host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Coordinator configuration.
///
/// Read when attaching; changes made afterwards apply to the next attach,
/// except the origin policy, which admission reads per request.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind
    pub host: String,
    /// Port to bind (0 = ephemeral)
    pub port: u16,
    /// Handshake path, without trailing slash
    pub path: String,
    /// Whether the client bundle would be served. Recorded only.
    pub serve_client: bool,
    /// Cross-origin admission policy
    pub origins: OriginPolicy,
    /// Base engine options
    pub engine: EngineOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: 0,
            path: DEFAULT_PATH.to_string(),
            serve_client: true,
            origins: OriginPolicy::default(),
            engine: EngineOptions::default(),
        }
    }
}

impl ServerConfig {
    /// Bind address as `host:port` for the given overrides.
    pub fn bind_address(&self, options: &AttachOptions) -> String {
        let host = options.host.as_deref().unwrap_or(&self.host);
        let port = options.port.unwrap_or(self.port);
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        }
    }
}

/// Per-call options for [`crate::Server::attach`].
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    /// Host override
    pub host: Option<String>,
    /// Port override
    pub port: Option<u16>,
    /// Engine option overrides; `path`, `allow_request` and `initial_packet`
    /// are always replaced by the coordinator
    pub engine: Option<EngineOptions>,
}

impl AttachOptions {
    /// Bind `host` instead of the configured one.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Bind `port` instead of the configured one.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Use these engine options instead of the configured ones.
    #[must_use]
    pub fn engine(mut self, engine: EngineOptions) -> Self {
        self.engine = Some(engine);
        self
    }
}

impl From<u16> for AttachOptions {
    fn from(port: u16) -> Self {
        Self::default().port(port)
    }
}

/// Strip exactly one trailing slash.
pub fn normalize_path(path: &str) -> String {
    path.strip_suffix('/').unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.path, "/socket.io");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
        assert!(config.serve_client);
        assert!(matches!(config.origins, OriginPolicy::Wildcard));
    }

    #[test]
    fn one_trailing_slash_is_stripped() {
        assert_eq!(normalize_path("/io/"), "/io");
        assert_eq!(normalize_path("/io//"), "/io/");
        assert_eq!(normalize_path("/io"), "/io");
    }

    #[test]
    fn overrides_win_in_bind_address() {
        let config = ServerConfig { host: "127.0.0.1".to_string(), port: 3000, ..Default::default() };
        assert_eq!(config.bind_address(&AttachOptions::default()), "127.0.0.1:3000");
        assert_eq!(config.bind_address(&AttachOptions::from(0)), "127.0.0.1:0");
        assert_eq!(config.bind_address(&AttachOptions::default().host("::1")), "[::1]:3000");
    }
}
