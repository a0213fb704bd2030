//! Compatibility surface for old-style `set(key, value)` configuration.
//!
//! Only a fixed table of legacy keys is translated onto engine options. The
//! coordinator handles `authorization`, `origins` and `resource` itself;
//! anything else is ignored.

use std::{sync::Arc, time::Duration};

use switchboard_core::Handshake;

use crate::{engine::EngineOption, origin::OriginPolicy};

/// Legacy authorization callback.
///
/// `Ok(true)` admits, `Ok(false)` rejects with "Not authorized", `Err(msg)`
/// rejects with `msg`.
pub type AuthorizationHook = Arc<dyn Fn(&Handshake) -> Result<bool, String> + Send + Sync>;

/// Value passed to [`crate::Server::set`].
#[derive(Clone)]
pub enum SettingValue {
    /// Flag
    Bool(bool),
    /// Number; durations are milliseconds
    Int(u64),
    /// Free text
    Text(String),
    /// List of strings
    List(Vec<String>),
    /// Origin policy
    Origins(OriginPolicy),
    /// Authorization callback
    Authorization(AuthorizationHook),
}

impl SettingValue {
    /// Wrap an authorization callback.
    pub fn authorization<F>(hook: F) -> Self
    where
        F: Fn(&Handshake) -> Result<bool, String> + Send + Sync + 'static,
    {
        Self::Authorization(Arc::new(hook))
    }

    fn as_list(&self) -> Option<Vec<String>> {
        match self {
            Self::List(items) => Some(items.clone()),
            Self::Text(text) => Some(
                text.split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for SettingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => f.debug_tuple("Bool").field(v).finish(),
            Self::Int(v) => f.debug_tuple("Int").field(v).finish(),
            Self::Text(v) => f.debug_tuple("Text").field(v).finish(),
            Self::List(v) => f.debug_tuple("List").field(v).finish(),
            Self::Origins(v) => f.debug_tuple("Origins").field(v).finish(),
            Self::Authorization(_) => f.write_str("Authorization(..)"),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u64> for SettingValue {
    fn from(value: u64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<String>> for SettingValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<OriginPolicy> for SettingValue {
    fn from(value: OriginPolicy) -> Self {
        Self::Origins(value)
    }
}

/// Old setting names that map onto engine options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyKey {
    /// `transports` → `transports`
    Transports,
    /// `heartbeat timeout` → `pingTimeout`
    HeartbeatTimeout,
    /// `heartbeat interval` → `pingInterval`
    HeartbeatInterval,
    /// `destroy buffer size` → `maxHttpBufferSize`
    DestroyBufferSize,
}

impl LegacyKey {
    /// Every translated key.
    pub const ALL: [Self; 4] =
        [Self::Transports, Self::HeartbeatTimeout, Self::HeartbeatInterval, Self::DestroyBufferSize];

    /// Look up a legacy setting name.
    pub fn lookup(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == key)
    }

    /// Legacy setting name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Transports => "transports",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::HeartbeatInterval => "heartbeat interval",
            Self::DestroyBufferSize => "destroy buffer size",
        }
    }

    /// Engine option name it translates to.
    pub fn target(self) -> &'static str {
        match self {
            Self::Transports => "transports",
            Self::HeartbeatTimeout => "pingTimeout",
            Self::HeartbeatInterval => "pingInterval",
            Self::DestroyBufferSize => "maxHttpBufferSize",
        }
    }

    /// Translate a value into the engine option, if it has the right shape.
    pub fn option(self, value: &SettingValue) -> Option<EngineOption> {
        match self {
            Self::Transports => value.as_list().map(EngineOption::Transports),
            Self::HeartbeatTimeout => {
                value.as_u64().map(|ms| EngineOption::PingTimeout(Duration::from_millis(ms)))
            },
            Self::HeartbeatInterval => {
                value.as_u64().map(|ms| EngineOption::PingInterval(Duration::from_millis(ms)))
            },
            Self::DestroyBufferSize => {
                value.as_u64().map(|n| EngineOption::MaxHttpBufferSize(n as usize))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_round_trips_names() {
        for key in LegacyKey::ALL {
            assert_eq!(LegacyKey::lookup(key.name()), Some(key));
        }
        assert_eq!(LegacyKey::lookup("log level"), None);
    }

    #[test]
    fn targets_match_engine_option_names() {
        for key in LegacyKey::ALL {
            let value = match key {
                LegacyKey::Transports => SettingValue::from("websocket"),
                _ => SettingValue::Int(10),
            };
            let option = key.option(&value).unwrap();
            assert_eq!(option.name(), key.target());
        }
    }

    #[test]
    fn zero_is_a_valid_value() {
        let option = LegacyKey::DestroyBufferSize.option(&SettingValue::Int(0));
        assert_eq!(option, Some(EngineOption::MaxHttpBufferSize(0)));
    }

    #[test]
    fn wrong_shape_is_not_translated() {
        assert_eq!(LegacyKey::HeartbeatTimeout.option(&SettingValue::Bool(true)), None);
        assert_eq!(LegacyKey::Transports.option(&SettingValue::Int(3)), None);
    }
}
