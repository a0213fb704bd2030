//! In-process engine.
//!
//! Connections are pairs of channels, so the whole admission and session
//! path runs without sockets. [`MemoryEngine::connect`] performs admission,
//! writes the open handshake and initial packet to the peer and hands the
//! connection to the listener before returning, which makes the resulting
//! state observable immediately.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use switchboard_core::{
    Handshake, ListenerId, RawConnection, SocketError, Transport,
    session::{Session, SessionAction},
};
use switchboard_proto::{EnginePacket, OpenHandshake};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ConnectionListener, Engine, EngineCore, EngineOption, EngineOptions, WEBSOCKET, generate_sid};
use crate::error::ServerError;

const MIN_TICK: Duration = Duration::from_millis(5);

struct MemoryTransport {
    sid: String,
    to_peer: mpsc::UnboundedSender<EnginePacket>,
    open: AtomicBool,
    closing: CancellationToken,
}

impl Transport for MemoryTransport {
    fn id(&self) -> &str {
        &self.sid
    }

    fn send(&self, message: String) -> Result<(), SocketError> {
        if !self.is_open() {
            return Err(SocketError::Transport("connection closed".to_string()));
        }
        self.to_peer
            .send(EnginePacket::Message(message))
            .map_err(|_| SocketError::Transport("peer gone".to_string()))
    }

    fn close(&self) {
        self.closing.cancel();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.closing.is_cancelled()
    }
}

struct MemoryInner {
    core: EngineCore,
    clients: Mutex<HashMap<String, Arc<MemoryTransport>>>,
    shutdown: CancellationToken,
}

/// Channel-backed engine for tests and embedding.
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<MemoryInner>,
}

impl MemoryEngine {
    /// Create an engine with the given options.
    pub fn new(options: EngineOptions) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                core: EngineCore::new(options),
                clients: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Open a connection as if a client had sent `handshake`.
    ///
    /// Must be called inside a tokio runtime; the session is driven by a
    /// spawned task.
    ///
    /// # Errors
    ///
    /// - `ServerError::Rejected` if the engine is closed, the path or
    ///   transport does not match, or admission denies the handshake
    /// - `ServerError::Internal` if no session id could be generated
    pub fn connect(&self, handshake: Handshake) -> Result<MemoryPeer, ServerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ServerError::Rejected("engine closed".to_string()));
        }

        let options = self.inner.core.options();
        let path = handshake.url.split('?').next().unwrap_or_default();
        let path = path.strip_suffix('/').unwrap_or(path);
        if path != options.path {
            return Err(ServerError::Rejected(format!("unknown path {path}")));
        }
        let requested = handshake.query("transport").unwrap_or(WEBSOCKET);
        if requested != WEBSOCKET || !options.allows_transport(WEBSOCKET) {
            return Err(ServerError::Rejected(format!("transport {requested} not allowed")));
        }
        if !options.admits(&handshake) {
            return Err(ServerError::Rejected("forbidden".to_string()));
        }

        let sid = generate_sid()?;
        let (to_peer, from_server) = mpsc::unbounded_channel();
        let (to_server, from_peer) = mpsc::unbounded_channel();
        let (deliver, incoming) = mpsc::unbounded_channel();

        let transport = Arc::new(MemoryTransport {
            sid: sid.clone(),
            to_peer: to_peer.clone(),
            open: AtomicBool::new(true),
            closing: self.inner.shutdown.child_token(),
        });

        let mut session =
            Session::new(sid.clone(), Instant::now(), options.session_config(), options.initial_packet);
        let opening = session
            .open(Instant::now())
            .map_err(|e| ServerError::Internal(format!("session open failed: {e}")))?;
        execute(opening, &to_peer, &deliver);

        self.inner.clients.lock().insert(sid.clone(), Arc::clone(&transport));
        let raw: Arc<dyn Transport> = Arc::clone(&transport) as Arc<dyn Transport>;
        self.inner.core.emit(RawConnection::new(raw, handshake, incoming));

        let period = options.ping_interval.min(options.ping_timeout).checked_div(2).unwrap_or(MIN_TICK);
        tokio::spawn(drive(
            Arc::clone(&self.inner),
            session,
            transport,
            from_peer,
            deliver,
            period.max(MIN_TICK),
        ));

        debug!(%sid, "memory connection open");
        Ok(MemoryPeer { sid, from_server, to_server })
    }
}

impl Engine for MemoryEngine {
    fn on_connection(&self, listener: ConnectionListener) -> ListenerId {
        self.inner.core.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.core.remove_listener(id)
    }

    fn set_option(&self, option: EngineOption) -> bool {
        self.inner.core.set_option(option);
        true
    }

    fn options(&self) -> EngineOptions {
        self.inner.core.options()
    }

    fn close(&self) {
        self.inner.shutdown.cancel();
    }

    fn clients_count(&self) -> usize {
        self.inner.clients.lock().len()
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine").field("clients", &self.clients_count()).finish_non_exhaustive()
    }
}

async fn drive(
    inner: Arc<MemoryInner>,
    mut session: Session,
    transport: Arc<MemoryTransport>,
    mut from_peer: mpsc::UnboundedReceiver<EnginePacket>,
    deliver: mpsc::UnboundedSender<String>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    let to_peer = transport.to_peer.clone();

    loop {
        tokio::select! {
            () = transport.closing.cancelled() => {
                execute(session.close(), &to_peer, &deliver);
                break;
            },
            packet = from_peer.recv() => {
                let Some(packet) = packet else { break };
                match session.handle_packet(packet, Instant::now()) {
                    Ok(actions) => {
                        if !execute(actions, &to_peer, &deliver) {
                            break;
                        }
                    },
                    Err(e) => {
                        debug!(sid = %transport.sid, error = %e, "session error");
                        execute(session.close(), &to_peer, &deliver);
                        break;
                    },
                }
            },
            _ = ticker.tick() => {
                if !execute(session.tick(Instant::now()), &to_peer, &deliver) {
                    // A local close still tells the peer
                    let _ = to_peer.send(EnginePacket::Close);
                    break;
                }
            },
        }
    }

    transport.open.store(false, Ordering::Release);
    inner.clients.lock().remove(&transport.sid);
    debug!(sid = %transport.sid, "memory connection closed");
}

fn execute(
    actions: Vec<SessionAction>,
    to_peer: &mpsc::UnboundedSender<EnginePacket>,
    deliver: &mpsc::UnboundedSender<String>,
) -> bool {
    for action in actions {
        match action {
            SessionAction::Send(packet) => {
                if to_peer.send(packet).is_err() {
                    return false;
                }
            },
            SessionAction::Deliver(message) => {
                if deliver.send(message).is_err() {
                    return false;
                }
            },
            SessionAction::Close { reason } => {
                debug!(reason, "session closed");
                return false;
            },
        }
    }
    true
}

/// Client end of a [`MemoryEngine`] connection.
#[derive(Debug)]
pub struct MemoryPeer {
    sid: String,
    from_server: mpsc::UnboundedReceiver<EnginePacket>,
    to_server: mpsc::UnboundedSender<EnginePacket>,
}

impl MemoryPeer {
    /// Session id assigned by the engine.
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Next engine packet from the server.
    pub async fn recv(&mut self) -> Option<EnginePacket> {
        self.from_server.recv().await
    }

    /// Next engine packet if one is already queued.
    pub fn try_recv(&mut self) -> Option<EnginePacket> {
        self.from_server.try_recv().ok()
    }

    /// Next application message, answering pings on the way.
    ///
    /// Returns `None` once the server closed the connection.
    pub async fn recv_message(&mut self) -> Option<String> {
        loop {
            match self.from_server.recv().await? {
                EnginePacket::Message(message) => return Some(message),
                EnginePacket::Ping(probe) => {
                    let _ = self.to_server.send(EnginePacket::Pong(probe));
                },
                EnginePacket::Close => return None,
                _ => {},
            }
        }
    }

    /// Consume the open handshake.
    ///
    /// # Errors
    ///
    /// - `ServerError::Protocol` if the first packet is not a valid open
    ///   handshake
    pub async fn handshake(&mut self) -> Result<OpenHandshake, ServerError> {
        let packet = self
            .from_server
            .recv()
            .await
            .ok_or_else(|| ServerError::Transport("closed before handshake".to_string()))?;
        Ok(OpenHandshake::from_packet(&packet)?)
    }

    /// Send an application message (an encoded namespace packet).
    ///
    /// Returns false if the server side is gone.
    pub fn send(&self, message: impl Into<String>) -> bool {
        self.send_packet(EnginePacket::Message(message.into()))
    }

    /// Send a raw engine packet.
    pub fn send_packet(&self, packet: EnginePacket) -> bool {
        self.to_server.send(packet).is_ok()
    }

    /// Close the connection from the peer side.
    pub fn close(&self) {
        let _ = self.to_server.send(EnginePacket::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> EngineOptions {
        EngineOptions { initial_packet: Some("0".to_string()), ..EngineOptions::default() }
    }

    fn handshake() -> Handshake {
        Handshake::new("/socket.io/?transport=websocket").with_query("transport", "websocket")
    }

    fn collect_into(engine: &MemoryEngine) -> Arc<Mutex<Vec<RawConnection>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.on_connection(Arc::new(move |conn: RawConnection| sink.lock().push(conn)));
        seen
    }

    #[tokio::test]
    async fn open_handshake_precedes_initial_packet() {
        let engine = MemoryEngine::new(options());
        let seen = collect_into(&engine);

        let mut peer = engine.connect(handshake()).unwrap();
        let open = peer.handshake().await.unwrap();

        assert_eq!(open.sid, peer.sid());
        assert_eq!(open.ping_interval, 25_000);
        assert_eq!(peer.recv().await, Some(EnginePacket::Message("0".to_string())));
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(engine.clients_count(), 1);
    }

    #[tokio::test]
    async fn admission_runs_before_anything_is_created() {
        let engine = MemoryEngine::new(EngineOptions {
            allow_request: Some(Arc::new(|_| false)),
            ..options()
        });
        let seen = collect_into(&engine);

        let err = engine.connect(handshake()).unwrap_err();
        assert!(matches!(err, ServerError::Rejected(_)));
        assert!(seen.lock().is_empty());
        assert_eq!(engine.clients_count(), 0);
    }

    #[tokio::test]
    async fn wrong_path_or_transport_is_rejected() {
        let engine = MemoryEngine::new(options());
        assert!(engine.connect(Handshake::new("/other/")).is_err());
        assert!(engine.connect(Handshake::new("/socket.io/").with_query("transport", "polling")).is_err());

        engine.set_option(EngineOption::Transports(vec!["polling".to_string()]));
        assert!(engine.connect(handshake()).is_err());
    }

    #[tokio::test]
    async fn messages_are_delivered_to_the_connection() {
        let engine = MemoryEngine::new(options());
        let seen = collect_into(&engine);

        let peer = engine.connect(handshake()).unwrap();
        let mut conn = seen.lock().pop().unwrap();

        assert!(peer.send("2[\"hi\"]"));
        assert_eq!(conn.incoming.recv().await.as_deref(), Some("2[\"hi\"]"));

        conn.transport.send("2[\"back\"]".to_string()).unwrap();
    }

    #[tokio::test]
    async fn engine_close_tells_peers() {
        let engine = MemoryEngine::new(options());
        let _seen = collect_into(&engine);
        let mut peer = engine.connect(handshake()).unwrap();
        peer.handshake().await.unwrap();

        engine.close();

        assert_eq!(peer.recv_message().await.as_deref(), Some("0"));
        assert_eq!(peer.recv_message().await, None);
        assert!(engine.connect(handshake()).is_err());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let engine = MemoryEngine::new(EngineOptions {
            ping_interval: Duration::from_millis(20),
            ping_timeout: Duration::from_millis(20),
            ..options()
        });
        let _seen = collect_into(&engine);
        let mut peer = engine.connect(handshake()).unwrap();
        peer.handshake().await.unwrap();

        let mut saw_ping = false;
        let deadline = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(packet) = peer.recv().await {
                match packet {
                    EnginePacket::Ping(_) => saw_ping = true,
                    EnginePacket::Close => break,
                    _ => {},
                }
            }
        });
        deadline.await.unwrap();

        assert!(saw_ping);
    }
}
