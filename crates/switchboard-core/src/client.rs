//! Per-connection packet routing.
//!
//! A [`Client`] wraps one transport connection. It decodes inbound messages
//! and routes them to the socket of the addressed namespace, creating sockets
//! on `Connect` and closing them on `Disconnect` or when the transport ends.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use switchboard_proto::{Decoder, Packet, PacketType, ProtocolError};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{
    error::ConnectError,
    registry::NamespaceRegistry,
    socket::{CLIENT_DISCONNECT, Socket},
    transport::{Handshake, Transport},
};

/// Reason given to sockets when their transport goes away.
pub const TRANSPORT_CLOSE: &str = "transport close";

/// One transport connection and the sockets it holds.
pub struct Client {
    transport: Arc<dyn Transport>,
    handshake: Arc<Handshake>,
    registry: Arc<NamespaceRegistry>,
    decoder: Arc<dyn Decoder>,
    /// Namespace name → socket
    sockets: Mutex<BTreeMap<String, Arc<Socket>>>,
    closed: AtomicBool,
}

impl Client {
    /// Wrap an accepted connection.
    pub fn new(
        transport: Arc<dyn Transport>,
        handshake: Handshake,
        registry: Arc<NamespaceRegistry>,
        decoder: Arc<dyn Decoder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            handshake: Arc::new(handshake),
            registry,
            decoder,
            sockets: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Client id (the engine session id).
    pub fn id(&self) -> &str {
        self.transport.id()
    }

    /// Request metadata.
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// Socket joined to `nsp`, if any.
    pub fn socket(&self, nsp: &str) -> Option<Arc<Socket>> {
        self.sockets.lock().get(nsp).filter(|s| s.connected()).cloned()
    }

    /// Number of live sockets.
    pub fn socket_count(&self) -> usize {
        self.sockets.lock().values().filter(|s| s.connected()).count()
    }

    /// Join the namespace `name`.
    ///
    /// A second connect to a namespace the client is already in returns the
    /// existing socket.
    ///
    /// # Errors
    ///
    /// - `ConnectError::InvalidNamespace` if no such namespace is registered;
    ///   the client is sent a `ConnectError` packet
    /// - any error from [`crate::Namespace::add`]
    pub fn connect(&self, name: &str) -> Result<Arc<Socket>, ConnectError> {
        let name = NamespaceRegistry::canonicalize(name);

        if let Some(existing) = self.socket(&name) {
            return Ok(existing);
        }

        let Some(nsp) = self.registry.get(&name) else {
            debug!(sid = %self.id(), nsp = %name, "connect to unknown namespace");
            self.send_packet(&Packet::connect_error(name.clone(), "Invalid namespace"));
            return Err(ConnectError::InvalidNamespace(name));
        };

        let socket = nsp.add(Arc::clone(&self.transport), Arc::clone(&self.handshake))?;
        self.sockets.lock().insert(name, Arc::clone(&socket));
        Ok(socket)
    }

    /// Decode one inbound message and route it.
    ///
    /// # Errors
    ///
    /// - `ProtocolError` if the message cannot be decoded. The caller is
    ///   expected to drop the connection.
    pub fn handle_message(&self, message: &str) -> Result<(), ProtocolError> {
        let packet = self.decoder.decode(message)?;
        trace!(sid = %self.id(), nsp = %packet.nsp, kind = ?packet.kind, "packet");

        match packet.kind {
            PacketType::Connect => {
                if let Err(err) = self.connect(&packet.nsp) {
                    debug!(sid = %self.id(), nsp = %packet.nsp, error = %err, "connect failed");
                }
            },
            PacketType::Disconnect => {
                let socket = self.sockets.lock().remove(&packet.nsp);
                if let Some(socket) = socket {
                    socket.on_close(CLIENT_DISCONNECT);
                }
            },
            PacketType::Event | PacketType::Ack => match self.socket(&packet.nsp) {
                Some(socket) => socket.dispatch(&packet),
                None => debug!(sid = %self.id(), nsp = %packet.nsp, "packet for unjoined namespace"),
            },
            PacketType::ConnectError | PacketType::BinaryEvent | PacketType::BinaryAck => {
                trace!(sid = %self.id(), kind = ?packet.kind, "ignoring client packet");
            },
        }

        Ok(())
    }

    /// Consume inbound messages until the connection ends, then close every
    /// socket with reason `"transport close"`.
    ///
    /// A message that fails to decode closes the transport.
    pub async fn run(self: Arc<Self>, mut incoming: mpsc::UnboundedReceiver<String>) {
        while let Some(message) = incoming.recv().await {
            if let Err(err) = self.handle_message(&message) {
                warn!(sid = %self.id(), error = %err, "dropping client after decode failure");
                self.transport.close();
                break;
            }
        }

        self.on_close(TRANSPORT_CLOSE);
    }

    /// Close every socket of this client. Idempotent.
    pub fn on_close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let sockets = std::mem::take(&mut *self.sockets.lock());
        debug!(sid = %self.id(), reason, sockets = sockets.len(), "client closed");

        for socket in sockets.into_values() {
            socket.on_close(reason);
        }
    }

    /// Disconnect every socket and close the transport.
    pub fn disconnect(&self) {
        let sockets = std::mem::take(&mut *self.sockets.lock());
        for socket in sockets.into_values() {
            socket.disconnect(false);
        }
        self.transport.close();
    }

    fn send_packet(&self, packet: &Packet) {
        let encoded = match self.registry.encoder().encode(packet) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(sid = %self.id(), error = %err, "failed to encode packet");
                return;
            },
        };
        if let Err(err) = self.transport.send(encoded) {
            debug!(sid = %self.id(), error = %err, "write failed");
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id())
            .field("sockets", &self.socket_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use switchboard_proto::TextCodec;

    use super::*;
    use crate::{adapter::MemoryAdapterFactory, error::SocketError};

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
        closed: AtomicBool,
    }

    impl Transport for Recorder {
        fn id(&self) -> &str {
            "c1"
        }

        fn send(&self, message: String) -> Result<(), SocketError> {
            self.sent.lock().push(message);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::Acquire)
        }
    }

    fn client() -> (Arc<Client>, Arc<Recorder>, Arc<NamespaceRegistry>) {
        let registry =
            Arc::new(NamespaceRegistry::new(Arc::new(TextCodec), Arc::new(MemoryAdapterFactory)));
        let transport = Arc::new(Recorder::default());
        let client = Client::new(
            transport.clone(),
            Handshake::new("/socket.io/"),
            Arc::clone(&registry),
            Arc::new(TextCodec),
        );
        (client, transport, registry)
    }

    #[test]
    fn connect_default_namespace_sends_nothing() {
        let (client, transport, registry) = client();
        let socket = client.connect("/").unwrap();

        assert_eq!(socket.id(), "c1");
        assert_eq!(registry.default_namespace().len(), 1);
        assert!(transport.sent.lock().is_empty());
    }

    #[test]
    fn connect_unknown_namespace_sends_error() {
        let (client, transport, _) = client();
        let err = client.connect("/nope").unwrap_err();

        assert_eq!(err, ConnectError::InvalidNamespace("/nope".to_string()));
        assert_eq!(transport.sent.lock().as_slice(), [r#"4/nope,{"message":"Invalid namespace"}"#]);
    }

    #[test]
    fn connect_packet_joins_namespace() {
        let (client, transport, registry) = client();
        let (chat, _) = registry.get_or_create("/chat");

        client.handle_message("0/chat,").unwrap();

        assert_eq!(chat.len(), 1);
        assert_eq!(client.socket("/chat").unwrap().id(), "/chat#c1");
        assert_eq!(transport.sent.lock().as_slice(), [r#"0/chat,{"sid":"/chat#c1"}"#]);
    }

    #[test]
    fn disconnect_packet_leaves_namespace() {
        let (client, _, registry) = client();
        client.connect("/").unwrap();

        client.handle_message("1").unwrap();

        assert!(registry.default_namespace().is_empty());
        assert!(client.socket("/").is_none());
    }

    #[test]
    fn undecodable_message_is_an_error() {
        let (client, _, _) = client();
        assert!(client.handle_message("9garbage").is_err());
    }

    #[test]
    fn on_close_closes_every_socket_once() {
        let (client, _, registry) = client();
        registry.get_or_create("/chat");
        client.connect("/").unwrap();
        client.connect("/chat").unwrap();

        client.on_close(TRANSPORT_CLOSE);
        client.on_close(TRANSPORT_CLOSE);

        assert_eq!(client.socket_count(), 0);
        for nsp in registry.namespaces() {
            assert!(nsp.is_empty());
        }
    }

    #[tokio::test]
    async fn run_closes_sockets_when_stream_ends() {
        let (client, _, registry) = client();
        client.connect("/").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("2[\"ping\"]".to_string()).unwrap();
        drop(tx);

        Arc::clone(&client).run(rx).await;

        assert!(registry.default_namespace().is_empty());
    }

    #[tokio::test]
    async fn run_closes_transport_on_decode_failure() {
        let (client, transport, _) = client();
        client.connect("/").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("x".to_string()).unwrap();

        Arc::clone(&client).run(rx).await;

        assert!(!transport.is_open());
        assert_eq!(client.socket_count(), 0);
        drop(tx);
    }
}
