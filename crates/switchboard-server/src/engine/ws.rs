//! WebSocket engine.
//!
//! Production engine over `tokio-tungstenite`. The [`crate::Endpoint`] accepts
//! TCP streams and hands them to [`WsEngine::handle_stream`], which performs
//! admission during the upgrade and then drives the connection's
//! [`Session`] until either side closes.
//!
//! # Upgrade rejections
//!
//! - 404: request path outside the configured handshake path
//! - 400: websocket is not an allowed transport, or the query asks for
//!   another transport
//! - 403: the admission callback denied the request

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use switchboard_core::{
    Handshake, ListenerId, RawConnection, SocketError, Transport,
    session::{Session, SessionAction},
};
use switchboard_proto::EnginePacket;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::tungstenite::{
    self, Message,
    handshake::server::{ErrorResponse, Request, Response},
    http::StatusCode,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    ConnectionListener, EngineCore, EngineOption, EngineOptions, WEBSOCKET, generate_sid, Engine,
};
use crate::error::ServerError;

/// Shortest heartbeat check period.
const MIN_TICK: Duration = Duration::from_millis(10);

/// Write side of one WebSocket connection.
struct WsTransport {
    sid: String,
    outbound: mpsc::UnboundedSender<EnginePacket>,
    open: AtomicBool,
    closing: CancellationToken,
}

impl Transport for WsTransport {
    fn id(&self) -> &str {
        &self.sid
    }

    fn send(&self, message: String) -> Result<(), SocketError> {
        if !self.is_open() {
            return Err(SocketError::Transport("connection closed".to_string()));
        }
        self.outbound
            .send(EnginePacket::Message(message))
            .map_err(|_| SocketError::Transport("connection closed".to_string()))
    }

    fn close(&self) {
        self.closing.cancel();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.closing.is_cancelled()
    }
}

struct WsInner {
    core: EngineCore,
    clients: Mutex<HashMap<String, Arc<WsTransport>>>,
    shutdown: CancellationToken,
}

/// WebSocket transport engine.
///
/// Cheap to clone; clones share connections and listeners.
#[derive(Clone)]
pub struct WsEngine {
    inner: Arc<WsInner>,
}

impl WsEngine {
    /// Create an engine with the given options.
    pub fn new(options: EngineOptions) -> Self {
        Self {
            inner: Arc::new(WsInner {
                core: EngineCore::new(options),
                clients: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Serve an accepted TCP stream on a new task.
    pub fn handle_stream(&self, stream: TcpStream, peer: SocketAddr) {
        if self.inner.shutdown.is_cancelled() {
            debug!(%peer, "engine closed, dropping stream");
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = serve(inner, stream, peer).await {
                debug!(%peer, error = %e, "connection ended with error");
            }
        });
    }

    /// Whether [`Engine::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl Engine for WsEngine {
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
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!(clients = self.clients_count(), "closing websocket engine");
        self.inner.shutdown.cancel();
    }

    fn clients_count(&self) -> usize {
        self.inner.clients.lock().len()
    }
}

impl std::fmt::Debug for WsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsEngine")
            .field("clients", &self.clients_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Upgrade, admit and drive a single connection.
async fn serve(inner: Arc<WsInner>, stream: TcpStream, peer: SocketAddr) -> Result<(), ServerError> {
    let options = inner.core.options();
    let mut admitted: Option<Handshake> = None;

    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let handshake = handshake_from_request(req, peer);

        if !path_matches(req.uri().path(), &options.path) {
            return Err(reject(StatusCode::NOT_FOUND, "unknown path"));
        }

        let requested = handshake.query("transport").unwrap_or(WEBSOCKET);
        if requested != WEBSOCKET || !options.allows_transport(WEBSOCKET) {
            return Err(reject(StatusCode::BAD_REQUEST, "transport unknown"));
        }

        if !options.admits(&handshake) {
            return Err(reject(StatusCode::FORBIDDEN, "forbidden"));
        }

        admitted = Some(handshake);
        Ok(response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "upgrade refused");
            return Ok(());
        },
    };
    let Some(handshake) = admitted else {
        return Err(ServerError::Internal("upgrade accepted without handshake".to_string()));
    };

    let sid = generate_sid()?;
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    let transport = Arc::new(WsTransport {
        sid: sid.clone(),
        outbound: out_tx,
        open: AtomicBool::new(true),
        closing: inner.shutdown.child_token(),
    });

    let mut session =
        Session::new(sid.clone(), Instant::now(), options.session_config(), options.initial_packet);
    let opening = session
        .open(Instant::now())
        .map_err(|e| ServerError::Internal(format!("session open failed: {e}")))?;
    if !execute(opening, &mut ws_tx, &in_tx).await {
        return Ok(());
    }

    debug!(%sid, %peer, "websocket connection open");
    inner.clients.lock().insert(sid.clone(), Arc::clone(&transport));

    let raw: Arc<dyn Transport> = Arc::clone(&transport) as Arc<dyn Transport>;
    inner.core.emit(RawConnection::new(raw, handshake, in_rx));

    let period = options.ping_interval.min(options.ping_timeout).checked_div(2).unwrap_or(MIN_TICK);
    let mut ticker = tokio::time::interval(period.max(MIN_TICK));
    let closing = transport.closing.clone();

    loop {
        tokio::select! {
            () = closing.cancelled() => {
                execute(session.close(), &mut ws_tx, &in_tx).await;
                break;
            },
            Some(packet) = out_rx.recv() => {
                if ws_tx.send(Message::Text(packet.encode().into())).await.is_err() {
                    break;
                }
            },
            frame = ws_rx.next() => {
                let Some(actions) = handle_frame(&mut session, frame, &sid) else {
                    break;
                };
                if !execute(actions, &mut ws_tx, &in_tx).await {
                    break;
                }
            },
            _ = ticker.tick() => {
                if !execute(session.tick(Instant::now()), &mut ws_tx, &in_tx).await {
                    break;
                }
            },
        }
    }

    transport.open.store(false, Ordering::Release);
    inner.clients.lock().remove(&sid);
    drop(in_tx);
    if let Err(e) = ws_tx.close().await {
        trace!(%sid, error = %e, "websocket close");
    }

    debug!(%sid, "websocket connection closed");
    Ok(())
}

/// Feed one inbound frame through the session. `None` ends the connection.
fn handle_frame(
    session: &mut Session,
    frame: Option<Result<Message, tungstenite::Error>>,
    sid: &str,
) -> Option<Vec<SessionAction>> {
    let text = match frame? {
        Ok(Message::Text(text)) => text,
        Ok(Message::Close(_)) => return None,
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => return Some(Vec::new()),
        Ok(Message::Binary(data)) => {
            debug!(sid, len = data.len(), "ignoring binary frame");
            return Some(Vec::new());
        },
        Err(e) => {
            debug!(sid, error = %e, "websocket read failed");
            return None;
        },
    };

    let packet = match EnginePacket::decode(text.as_str()) {
        Ok(packet) => packet,
        Err(e) => {
            warn!(sid, error = %e, "malformed engine packet");
            return None;
        },
    };

    match session.handle_packet(packet, Instant::now()) {
        Ok(actions) => Some(actions),
        Err(e) => {
            warn!(sid, error = %e, peer_error = e.is_peer_error(), "session error");
            None
        },
    }
}

/// Execute session actions. Returns false once the connection should end.
async fn execute<S>(
    actions: Vec<SessionAction>,
    ws_tx: &mut S,
    deliver: &mpsc::UnboundedSender<String>,
) -> bool
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    for action in actions {
        match action {
            SessionAction::Send(packet) => {
                if ws_tx.send(Message::Text(packet.encode().into())).await.is_err() {
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

fn handshake_from_request(req: &Request, peer: SocketAddr) -> Handshake {
    let mut handshake = Handshake::new(req.uri().to_string()).with_remote_addr(peer);

    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            handshake = handshake.with_header(name.as_str(), value);
        }
    }

    if let Some(query) = req.uri().query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            handshake = handshake.with_query(key, value);
        }
    }

    handshake
}

/// `path` itself or anything below it.
fn path_matches(request: &str, path: &str) -> bool {
    let request = request.strip_suffix('/').unwrap_or(request);
    request == path || request.strip_prefix(path).is_some_and(|rest| rest.starts_with('/'))
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_matching() {
        assert!(path_matches("/socket.io/", "/socket.io"));
        assert!(path_matches("/socket.io", "/socket.io"));
        assert!(path_matches("/socket.io/extra", "/socket.io"));
        assert!(!path_matches("/socket.iox", "/socket.io"));
        assert!(!path_matches("/other/", "/socket.io"));
    }

    #[test]
    fn transport_send_fails_after_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = WsTransport {
            sid: "s".to_string(),
            outbound: tx,
            open: AtomicBool::new(true),
            closing: CancellationToken::new(),
        };

        transport.send("2[\"a\"]".to_string()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), EnginePacket::Message("2[\"a\"]".to_string()));

        transport.close();
        assert!(!transport.is_open());
        assert!(transport.send("x".to_string()).is_err());
    }
}
