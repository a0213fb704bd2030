//! Cross-origin admission.
//!
//! Every inbound connection attempt is checked against the server's
//! [`OriginPolicy`] before the engine creates anything for it. The declared
//! origin comes from the `Origin` header, then `Referer`, then the literal
//! `*` when neither is present or both are empty.
//!
//! # Security
//!
//! Admission fails closed: an unparsable origin, an origin without a host or a
//! failing predicate all deny the request.

use std::sync::Arc;

use switchboard_core::Handshake;
use tracing::{debug, warn};
use url::Url;

use crate::error::AdmissionError;

/// Pattern that admits every origin.
pub const WILDCARD: &str = "*:*";

/// Custom admission predicate over the declared origin.
pub type OriginPredicate = Arc<dyn Fn(&str) -> Result<bool, AdmissionError> + Send + Sync>;

/// Which origins may connect.
#[derive(Clone, Default)]
pub enum OriginPolicy {
    /// Any origin, including malformed ones
    #[default]
    Wildcard,
    /// `host:port`, `host:*` or `*:port` patterns
    PatternList(Vec<String>),
    /// Delegate the decision entirely
    Predicate(OriginPredicate),
}

impl OriginPolicy {
    /// Parse a whitespace- or comma-separated pattern string.
    ///
    /// `"*:*"` anywhere in the string yields [`OriginPolicy::Wildcard`].
    pub fn parse(patterns: &str) -> Self {
        let tokens: Vec<String> = patterns
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        if tokens.iter().any(|t| t == WILDCARD) { Self::Wildcard } else { Self::PatternList(tokens) }
    }

    /// Policy from an explicit pattern list.
    pub fn patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::PatternList(patterns.into_iter().map(Into::into).collect())
    }

    /// Policy from a predicate.
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&str) -> Result<bool, AdmissionError> + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(predicate))
    }

    /// Decide whether `origin` may connect.
    pub fn allows(&self, origin: &str) -> bool {
        let patterns = match self {
            Self::Predicate(predicate) => {
                return predicate(origin).unwrap_or_else(|err| {
                    warn!(origin, error = %err, "origin predicate failed");
                    false
                });
            },
            Self::Wildcard => return true,
            Self::PatternList(patterns) => patterns,
        };

        if patterns.iter().any(|p| p == WILDCARD) {
            return true;
        }

        let Some((host, port)) = host_and_port(origin) else {
            debug!(origin, "unparsable origin");
            return false;
        };

        let candidates = [format!("{host}:{port}"), format!("{host}:*"), format!("*:{port}")];
        patterns.iter().any(|p| candidates.contains(p))
    }

    /// Admission callback for the engine: extract the declared origin from
    /// the request and check it.
    pub fn check_request(&self, handshake: &Handshake) -> bool {
        let origin = request_origin(handshake);
        let allowed = self.allows(origin);
        if !allowed {
            warn!(origin, url = %handshake.url, "origin rejected");
        }
        allowed
    }
}

impl std::fmt::Debug for OriginPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wildcard => f.write_str("Wildcard"),
            Self::PatternList(patterns) => f.debug_tuple("PatternList").field(patterns).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<&str> for OriginPolicy {
    fn from(patterns: &str) -> Self {
        Self::parse(patterns)
    }
}

/// Declared origin of a request: `Origin`, else `Referer`, else `*`.
pub fn request_origin(handshake: &Handshake) -> &str {
    ["origin", "referer"]
        .into_iter()
        .filter_map(|name| handshake.header(name))
        .find(|value| !value.is_empty())
        .unwrap_or("*")
}

/// Host and port of an origin URL.
///
/// Without an explicit port, every scheme with a known default gets it
/// (`https`/`wss` 443, `ftp` 21, ...), not only `https`. Anything else is 80.
fn host_and_port(origin: &str) -> Option<(String, u16)> {
    let url = Url::parse(origin).ok()?;
    let host = url.host_str()?.to_string();
    let port = url.port_or_known_default().unwrap_or(80);
    Some((host, port))
}
