//! Namespace behavior tests
//!
//! Admission, middleware, rooms, broadcasts and acks, driven through a
//! recording transport so every written packet can be inspected.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use serde_json::{Value, json};
use switchboard_core::{
    Adapter, AdapterFactory, Client, ConnectError, Handshake, MemoryAdapter, MemoryAdapterFactory,
    MiddlewareError, Namespace, NamespaceRegistry, Socket, SocketError, Transport,
};
use switchboard_proto::{Decoder, TextCodec};

/// Transport that records every write
struct Recorder {
    id: String,
    sent: Mutex<Vec<String>>,
    open: AtomicBool,
}

impl Recorder {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            sent: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        })
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

impl Transport for Recorder {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, message: String) -> Result<(), SocketError> {
        if !self.is_open() {
            return Err(SocketError::Transport("closed".to_string()));
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

fn registry() -> NamespaceRegistry {
    NamespaceRegistry::new(Arc::new(TextCodec), Arc::new(MemoryAdapterFactory))
}

fn join(nsp: &Arc<Namespace>, id: &str) -> (Arc<Socket>, Arc<Recorder>) {
    let transport = Recorder::new(id);
    let socket = nsp.add(transport.clone(), Arc::new(Handshake::new("/socket.io/"))).unwrap();
    (socket, transport)
}

#[test]
fn socket_joins_room_named_after_itself() {
    let registry = registry();
    let (chat, _) = registry.get_or_create("/chat");
    let (socket, _) = join(&chat, "c1");

    assert_eq!(socket.id(), "/chat#c1");
    assert_eq!(socket.rooms(), vec!["/chat#c1"]);
    assert_eq!(chat.clients(), vec!["/chat#c1"]);
}

#[test]
fn middleware_rejection_never_registers() {
    let registry = registry();
    let nsp = registry.default_namespace();
    nsp.use_middleware(|_| Err(MiddlewareError::new("Not authorized")));

    let connected = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&connected);
    nsp.on(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let transport = Recorder::new("c1");
    let err = nsp.add(transport.clone(), Arc::new(Handshake::default())).unwrap_err();

    assert!(matches!(err, ConnectError::Rejected(ref e) if e.message() == "Not authorized"));
    assert!(nsp.is_empty());
    assert!(nsp.clients().is_empty());
    assert_eq!(connected.load(Ordering::SeqCst), 0);
    assert_eq!(transport.sent(), vec![r#"4{"message":"Not authorized"}"#]);
}

#[test]
fn middleware_runs_in_order_and_stops_at_first_error() {
    let registry = registry();
    let nsp = registry.default_namespace();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&calls);
    nsp.use_middleware(move |_| {
        log.lock().push("first");
        Err(MiddlewareError::new("nope").with_data(json!({ "retry": false })))
    });
    let log = Arc::clone(&calls);
    nsp.use_middleware(move |_| {
        log.lock().push("second");
        Ok(())
    });

    let transport = Recorder::new("c1");
    assert!(nsp.add(transport.clone(), Arc::new(Handshake::default())).is_err());

    assert_eq!(*calls.lock(), vec!["first"]);

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    let packet = TextCodec.decode(&sent[0]).unwrap();
    assert_eq!(packet.error_message(), Some("nope"));
    assert_eq!(packet.data.unwrap()["data"], json!({ "retry": false }));
}

#[test]
fn default_namespace_with_middleware_confirms_connect() {
    let registry = registry();
    let nsp = registry.default_namespace();
    nsp.use_middleware(|_| Ok(()));

    let (_, transport) = join(nsp, "c1");
    assert_eq!(transport.sent(), vec![r#"0{"sid":"c1"}"#]);
}

#[test]
fn once_listener_fires_once_and_off_removes() {
    let registry = registry();
    let nsp = registry.default_namespace();
    let once_calls = Arc::new(AtomicUsize::new(0));
    let every_calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&once_calls);
    nsp.once(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&every_calls);
    let id = nsp.on(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    join(nsp, "c1");
    join(nsp, "c2");
    assert!(nsp.off(id));
    assert!(!nsp.off(id));
    join(nsp, "c3");

    assert_eq!(once_calls.load(Ordering::SeqCst), 1);
    assert_eq!(every_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn broadcast_to_room_excludes_sender() {
    let registry = registry();
    let nsp = registry.default_namespace();
    let (a, ta) = join(nsp, "a");
    let (b, tb) = join(nsp, "b");
    let (_, tc) = join(nsp, "c");

    a.join("lobby");
    b.join("lobby");

    let delivered = a.to("lobby").emit("hello", vec![json!(1)]).unwrap();

    assert_eq!(delivered, 1);
    assert!(ta.sent().is_empty());
    assert_eq!(tb.sent(), vec![r#"2["hello",1]"#]);
    assert!(tc.sent().is_empty());
}

#[test]
fn namespace_emit_reaches_everyone() {
    let registry = registry();
    let nsp = registry.default_namespace();
    let (_, ta) = join(nsp, "a");
    let (_, tb) = join(nsp, "b");

    assert_eq!(nsp.send(vec![json!("hi")]).unwrap(), 2);
    assert_eq!(ta.sent(), vec![r#"2["message","hi"]"#]);
    assert_eq!(tb.sent(), ta.sent());
}

#[test]
fn on_close_leaves_rooms_and_runs_handlers_once() {
    let registry = registry();
    let nsp = registry.default_namespace();
    let (socket, _) = join(nsp, "a");
    socket.join("lobby");

    let reasons = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&reasons);
    socket.on_disconnect(move |_, reason| log.lock().push(reason.to_string()));

    socket.on_close("transport close");
    socket.on_close("transport close");

    assert!(!socket.connected());
    assert!(nsp.is_empty());
    assert!(nsp.to("lobby").clients().is_empty());
    assert_eq!(*reasons.lock(), vec!["transport close"]);
    assert_eq!(socket.emit("late", vec![]), Err(SocketError::Disconnected));
}

#[test]
fn disconnect_tells_client_and_optionally_closes_transport() {
    let registry = registry();
    let (chat, _) = registry.get_or_create("/chat");
    let (socket, transport) = join(&chat, "a");

    socket.disconnect(true);

    assert!(chat.is_empty());
    assert!(!transport.is_open());
    assert_eq!(transport.sent().last().map(String::as_str), Some("1/chat,"));
}

#[test]
fn event_handlers_receive_args_and_ack() {
    let registry = Arc::new(registry());
    let transport = Recorder::new("c1");
    let client = Client::new(
        transport.clone(),
        Handshake::default(),
        Arc::clone(&registry),
        Arc::new(TextCodec),
    );
    let socket = client.connect("/").unwrap();

    socket.on("echo", |_, args, ack| {
        if let Some(ack) = ack {
            ack.send(args.to_vec()).unwrap();
        }
    });
    let handled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&handled);
    socket.on("echo", move |_, _, ack| {
        flag.store(true, Ordering::SeqCst);
        // Second reply on a shared ack is swallowed
        assert_eq!(ack.map(|a| a.send(vec![]).unwrap()), Some(false));
    });

    client.handle_message(r#"24["echo","x"]"#).unwrap();

    assert!(handled.load(Ordering::SeqCst));
    assert_eq!(transport.sent(), vec![r#"34["x"]"#]);
}

#[test]
fn ack_callback_runs_with_client_reply() {
    let registry = Arc::new(registry());
    let transport = Recorder::new("c1");
    let client = Client::new(
        transport.clone(),
        Handshake::default(),
        Arc::clone(&registry),
        Arc::new(TextCodec),
    );
    let socket = client.connect("/").unwrap();

    let reply = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&reply);
    let id = socket
        .emit_with_ack("question", vec![], move |args: &[Value]| {
            *slot.lock() = Some(args.to_vec());
        })
        .unwrap();

    assert_eq!(transport.sent(), vec![format!(r#"2{id}["question"]"#)]);

    client.handle_message(&format!("3{id}[42]")).unwrap();
    assert_eq!(*reply.lock(), Some(vec![json!(42)]));
}

#[test]
fn events_for_unjoined_namespace_are_dropped() {
    let registry = Arc::new(registry());
    registry.get_or_create("/chat");
    let transport = Recorder::new("c1");
    let client =
        Client::new(transport.clone(), Handshake::default(), registry, Arc::new(TextCodec));

    client.handle_message(r#"2/chat,["hello"]"#).unwrap();
    assert!(transport.sent().is_empty());
}

#[test]
fn adapter_reinit_keeps_room_memberships() {
    struct Custom;

    impl AdapterFactory for Custom {
        fn name(&self) -> &str {
            "custom"
        }

        fn create(&self, _nsp: &str) -> Box<dyn Adapter> {
            Box::new(MemoryAdapter::new())
        }
    }

    let registry = registry();
    let nsp = registry.default_namespace();
    let (socket, _) = join(nsp, "a");
    socket.join("lobby");

    registry.reinit_adapters(Arc::new(Custom));

    assert_eq!(nsp.adapter_name(), "custom");
    assert_eq!(socket.rooms(), vec!["a", "lobby"]);
}

#[test]
fn catch_all_handler_sees_every_event_name() {
    let registry = Arc::new(registry());
    let transport = Recorder::new("c1");
    let client = Client::new(
        transport.clone(),
        Handshake::default(),
        Arc::clone(&registry),
        Arc::new(TextCodec),
    );
    let socket = client.connect("/").unwrap();

    let named = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&named);
    socket.on("ping", move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    socket.on_any(move |_, event, args, _| {
        log.lock().push((event.to_string(), args.to_vec()));
    });

    client.handle_message(r#"2["ping"]"#).unwrap();
    client.handle_message(r#"2["other",1]"#).unwrap();

    assert_eq!(named.load(Ordering::SeqCst), 1);
    assert_eq!(
        *seen.lock(),
        vec![("ping".to_string(), vec![]), ("other".to_string(), vec![json!(1)])]
    );
}
