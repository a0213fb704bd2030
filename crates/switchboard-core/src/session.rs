//! Engine session state machine.
//!
//! Manages the transport-level lifecycle of one connection: open handshake,
//! heartbeats, timeouts and close. Uses the action pattern: methods take time
//! as input and return actions for the engine driver to execute. The state
//! machine itself does no I/O, which keeps heartbeat logic testable without a
//! clock.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  open()   ┌──────┐  Close / ping timeout / close()  ┌────────┐
//! │ Opening │──────────>│ Open │─────────────────────────────────>│ Closed │
//! └─────────┘           └──────┘                                  └────────┘
//! ```
//!
//! `open()` emits the `Open` packet followed by the optional initial packet.
//! The initial packet is how the namespace-level "connected to `/`" reply rides
//! along with the transport handshake instead of costing an extra round trip.

use std::{
    ops::Sub,
    time::{Duration, Instant},
};

use switchboard_proto::{EnginePacket, OpenHandshake};

use crate::error::SessionError;

/// Interval between server pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(25_000);

/// Time allowed for the peer to answer a ping.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(20_000);

/// Largest accepted inbound message.
pub const DEFAULT_MAX_PAYLOAD: usize = 1_000_000;

/// Actions returned by the session state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Write this packet to the peer
    Send(EnginePacket),

    /// Hand this application message to the client layer
    Deliver(String),

    /// Tear the connection down
    Close {
        /// Reason for closing the connection
        reason: String,
    },
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport accepted, open packet not yet sent
    Opening,
    /// Handshake sent, exchanging messages
    Open,
    /// Connection closed (graceful or error)
    Closed,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between pings
    pub ping_interval: Duration,
    /// Time to wait for a pong
    pub ping_timeout: Duration,
    /// Largest accepted inbound message in bytes
    pub max_payload: usize,
    /// Transports advertised for upgrade
    pub upgrades: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            max_payload: DEFAULT_MAX_PAYLOAD,
            upgrades: Vec::new(),
        }
    }
}

/// Session state machine
///
/// Generic over `Instant` to support virtual time in tests.
#[derive(Debug, Clone)]
pub struct Session<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    state: SessionState,
    config: SessionConfig,
    sid: String,
    initial_packet: Option<String>,
    /// When the last ping was sent (or the session opened)
    last_ping: I,
    /// Set while a ping is outstanding
    awaiting_pong_since: Option<I>,
}

impl<I> Session<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a new session in [`SessionState::Opening`] state.
    pub fn new(
        sid: impl Into<String>,
        now: I,
        config: SessionConfig,
        initial_packet: Option<String>,
    ) -> Self {
        Self {
            state: SessionState::Opening,
            config,
            sid: sid.into(),
            initial_packet,
            last_ping: now,
            awaiting_pong_since: None,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session id
    #[must_use]
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Send the open handshake, followed by the initial packet if any.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` if not in Opening state
    pub fn open(&mut self, now: I) -> Result<Vec<SessionAction>, SessionError> {
        if self.state != SessionState::Opening {
            return Err(SessionError::InvalidState { state: self.state, operation: "open" });
        }

        let handshake = OpenHandshake {
            sid: self.sid.clone(),
            upgrades: self.config.upgrades.clone(),
            ping_interval: self.config.ping_interval.as_millis() as u64,
            ping_timeout: self.config.ping_timeout.as_millis() as u64,
            max_payload: self.config.max_payload as u64,
        };

        let mut actions = vec![SessionAction::Send(handshake.to_packet()?)];

        if let Some(initial) = self.initial_packet.take() {
            actions.push(SessionAction::Send(EnginePacket::Message(initial)));
        }

        self.state = SessionState::Open;
        self.last_ping = now;

        Ok(actions)
    }

    /// Process an inbound packet.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` if the session is not open
    /// - `SessionError::UnexpectedPacket` for a client-sent `Open`
    pub fn handle_packet(
        &mut self,
        packet: EnginePacket,
        now: I,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if self.state != SessionState::Open {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "handle_packet",
            });
        }

        match packet {
            EnginePacket::Ping(probe) => Ok(vec![SessionAction::Send(EnginePacket::Pong(probe))]),
            EnginePacket::Pong(_) => {
                self.awaiting_pong_since = None;
                self.last_ping = self.last_ping.max(now);
                Ok(vec![])
            },
            EnginePacket::Message(body) if body.len() > self.config.max_payload => {
                self.state = SessionState::Closed;
                Ok(vec![SessionAction::Close {
                    reason: format!("payload of {} bytes exceeds limit", body.len()),
                }])
            },
            EnginePacket::Message(body) => Ok(vec![SessionAction::Deliver(body)]),
            EnginePacket::Close => {
                self.state = SessionState::Closed;
                Ok(vec![SessionAction::Close { reason: "transport close".to_string() }])
            },
            EnginePacket::Upgrade | EnginePacket::Noop => Ok(vec![]),
            EnginePacket::Open(_) => {
                Err(SessionError::UnexpectedPacket { state: self.state, packet: "open" })
            },
        }
    }

    /// Process periodic maintenance (ping scheduling and pong timeout).
    pub fn tick(&mut self, now: I) -> Vec<SessionAction> {
        if self.state != SessionState::Open {
            return Vec::new();
        }

        if let Some(since) = self.awaiting_pong_since {
            if now - since >= self.config.ping_timeout {
                self.state = SessionState::Closed;
                return vec![SessionAction::Close { reason: "ping timeout".to_string() }];
            }
            return Vec::new();
        }

        if now - self.last_ping >= self.config.ping_interval {
            self.last_ping = now;
            self.awaiting_pong_since = Some(now);
            return vec![SessionAction::Send(EnginePacket::Ping(None))];
        }

        Vec::new()
    }

    /// Close from the server side.
    ///
    /// Returns the close packet to send if the peer has not been told yet.
    pub fn close(&mut self) -> Vec<SessionAction> {
        match self.state {
            SessionState::Closed => Vec::new(),
            SessionState::Opening => {
                self.state = SessionState::Closed;
                Vec::new()
            },
            SessionState::Open => {
                self.state = SessionState::Closed;
                vec![SessionAction::Send(EnginePacket::Close)]
            },
        }
    }
}
