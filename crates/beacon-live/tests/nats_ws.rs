//! Live bindings against a fake NATS server speaking over WebSocket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use beacon_core::{Endpoint, Envelope, EnvelopeDecoder, Message, Topic};
use beacon_live::{ControllerState, DeliveryStrategy, LiveBinding, LiveContext, LiveError};
use beacon_transport::{NatsOptions, NatsTransport};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const INFO: &str = "INFO {\"server_id\":\"fake\",\"server_name\":\"fake-nats\",\"version\":\"2.10.0\",\"proto\":1,\"max_payload\":1048576}\r\n";

// ─────────────────────────────────────────────────────────────────────────────
// Fake server
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
enum Seen {
    Connected(usize),
    Op(usize, String),
    Disconnected(usize),
}

struct Conn {
    subs: HashMap<u64, String>,
    out: mpsc::UnboundedSender<WsMessage>,
}

#[derive(Default)]
struct ServerState {
    conns: HashMap<usize, Conn>,
    rejected: Vec<String>,
}

struct FakeNats {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    seen: mpsc::UnboundedReceiver<Seen>,
}

impl FakeNats {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(ServerState::default()));
        let (seen_tx, seen) = mpsc::unbounded_channel();

        let accept_state = Arc::clone(&state);
        drop(tokio::spawn(async move {
            let mut next = 0;
            while let Ok((stream, _)) = listener.accept().await {
                next += 1;
                drop(tokio::spawn(serve(
                    next,
                    stream,
                    Arc::clone(&accept_state),
                    seen_tx.clone(),
                )));
            }
        }));
        Self { addr, state, seen }
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::parse(&format!("ws://{}", self.addr)).unwrap()
    }

    fn reject(&self, subject: &str) {
        self.state.lock().rejected.push(subject.to_owned());
    }

    /// Send `payload` to every subscription on exactly `subject`, splitting
    /// each MSG across two WebSocket messages.
    fn publish(&self, subject: &str, payload: &str) {
        let state = self.state.lock();
        for conn in state.conns.values() {
            for (sid, subscribed) in &conn.subs {
                if subscribed != subject {
                    continue;
                }
                let head = format!("MSG {subject} {sid} {}\r\n", payload.len());
                let _ = conn.out.send(WsMessage::binary(head.into_bytes()));
                let _ = conn.out.send(WsMessage::binary(format!("{payload}\r\n").into_bytes()));
            }
        }
    }

    async fn next_seen(&mut self) -> Seen {
        tokio::time::timeout(Duration::from_secs(5), self.seen.recv())
            .await
            .expect("fake server went quiet")
            .expect("fake server stopped")
    }
}

async fn serve(
    conn: usize,
    stream: TcpStream,
    state: Arc<Mutex<ServerState>>,
    seen: mpsc::UnboundedSender<Seen>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let (out, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let _ = state.lock().conns.insert(
        conn,
        Conn {
            subs: HashMap::new(),
            out: out.clone(),
        },
    );
    let _ = out.send(WsMessage::text(INFO));
    let _ = seen.send(Seen::Connected(conn));

    let mut buf = String::new();
    while let Some(Ok(msg)) = source.next().await {
        match msg {
            WsMessage::Binary(data) => buf.push_str(&String::from_utf8_lossy(&data)),
            WsMessage::Text(text) => buf.push_str(text.as_str()),
            WsMessage::Close(_) => break,
            _ => continue,
        }
        while let Some(end) = buf.find("\r\n") {
            let line: String = buf.drain(..end + 2).collect();
            respond(conn, line.trim_end(), &state, &out, &seen);
        }
    }

    let _ = state.lock().conns.remove(&conn);
    writer.abort();
    let _ = seen.send(Seen::Disconnected(conn));
}

fn respond(
    conn: usize,
    line: &str,
    state: &Mutex<ServerState>,
    out: &mpsc::UnboundedSender<WsMessage>,
    seen: &mpsc::UnboundedSender<Seen>,
) {
    let mut parts = line.split_whitespace();
    let reply = match parts.next() {
        Some("CONNECT") => "+OK\r\n".to_owned(),
        Some("PING") => "PONG\r\n".to_owned(),
        Some("SUB") => {
            let subject = parts.next().unwrap_or_default().to_owned();
            let sid: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or_default();
            let _ = seen.send(Seen::Op(conn, line.to_owned()));
            let mut state = state.lock();
            if state.rejected.contains(&subject) {
                format!("-ERR 'Permissions Violation for Subscription to {subject}'\r\n")
            } else {
                if let Some(c) = state.conns.get_mut(&conn) {
                    let _ = c.subs.insert(sid, subject);
                }
                "+OK\r\n".to_owned()
            }
        }
        Some("UNSUB") => {
            let sid: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or_default();
            let _ = seen.send(Seen::Op(conn, line.to_owned()));
            if let Some(c) = state.lock().conns.get_mut(&conn) {
                let _ = c.subs.remove(&sid);
            }
            "+OK\r\n".to_owned()
        }
        _ => return,
    };
    let _ = out.send(WsMessage::text(reply));
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn context(server: &FakeNats) -> LiveContext {
    let transport = NatsTransport::new(NatsOptions {
        connect_timeout: Duration::from_secs(2),
        ack_timeout: Duration::from_secs(2),
        ..NatsOptions::default()
    });
    LiveContext::new(server.endpoint(), Arc::new(transport))
}

fn topic(s: &str) -> Topic {
    Topic::new(s).unwrap()
}

fn ids(tx: &mpsc::UnboundedSender<String>) -> impl Fn(Message<Envelope>) + Send + Sync + 'static {
    let tx = tx.clone();
    move |m: Message<Envelope>| {
        let _ = tx.send(m.value.id);
    }
}

async fn streaming<S>(binding: &LiveBinding<EnvelopeDecoder, S>)
where
    S: DeliveryStrategy<Envelope>,
{
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        binding
            .handle()
            .unwrap()
            .wait_for(|s| s == ControllerState::Streaming || s == ControllerState::Errored),
    )
    .await
    .unwrap();
    assert_eq!(state, ControllerState::Streaming);
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("nothing delivered")
        .expect("channel closed")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn push_binding_skips_truncated_frame() {
    let mut server = FakeNats::start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut binding = LiveBinding::push(
        context(&server),
        EnvelopeDecoder::<serde_json::Value>::new(),
        ids(&tx),
    );

    binding.activate(topic("feedback.create")).await;
    streaming(&binding).await;
    assert_eq!(server.next_seen().await, Seen::Connected(1));
    assert_eq!(server.next_seen().await, Seen::Op(1, "SUB feedback.create 1".into()));

    server.publish(
        "feedback.create",
        r#"{"id":"1","timestamp":"2024-01-01T00:00:00Z","data":{"action":"created"}}"#,
    );
    server.publish("feedback.create", r#"{"id":"2""#);
    server.publish(
        "feedback.create",
        r#"{"id":"3","timestamp":"2024-01-01T00:00:01Z","data":{}}"#,
    );

    assert_eq!(recv(&mut rx).await, "1");
    assert_eq!(recv(&mut rx).await, "3");
    let stats = binding.stats().unwrap();
    assert_eq!(stats.delivered(), 2);
    assert_eq!(stats.decode_failures(), 1);

    binding.deactivate().await;
    assert_eq!(server.next_seen().await, Seen::Op(1, "UNSUB 1".into()));
    assert_eq!(server.next_seen().await, Seen::Disconnected(1));
}

#[tokio::test]
async fn topic_change_unsubscribes_and_closes_first() {
    let mut server = FakeNats::start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut binding = LiveBinding::push(
        context(&server),
        EnvelopeDecoder::<serde_json::Value>::new(),
        ids(&tx),
    );

    binding.activate(topic("feedback.create")).await;
    streaming(&binding).await;
    binding.activate(topic("feedback.update")).await;
    streaming(&binding).await;

    let mut order = Vec::new();
    for _ in 0..6 {
        order.push(server.next_seen().await);
    }
    let position = |event: Seen| {
        order
            .iter()
            .position(|e| *e == event)
            .unwrap_or_else(|| panic!("{event:?} not seen in {order:?}"))
    };
    let old_sub = position(Seen::Op(1, "SUB feedback.create 1".into()));
    let old_unsub = position(Seen::Op(1, "UNSUB 1".into()));
    let new_sub = position(Seen::Op(2, "SUB feedback.update 1".into()));
    let _ = position(Seen::Disconnected(1));
    assert!(old_sub < old_unsub);
    assert!(old_unsub < new_sub);

    server.publish(
        "feedback.update",
        r#"{"id":"u1","timestamp":"2024-01-01T00:00:00Z","data":{}}"#,
    );
    assert_eq!(recv(&mut rx).await, "u1");
    binding.deactivate().await;
}

#[tokio::test]
async fn rejected_subject_surfaces_subscribe_error() {
    let mut server = FakeNats::start().await;
    server.reject("secret.create");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut binding = LiveBinding::push(
        context(&server),
        EnvelopeDecoder::<serde_json::Value>::new(),
        |_m| {},
    );
    binding.set_error_handler(move |e| {
        let _ = tx.send(e);
    });

    binding.activate(topic("secret.create")).await;
    let error = recv(&mut rx).await;
    assert!(matches!(error, LiveError::Subscribe { .. }), "{error:?}");
    assert_eq!(binding.state(), Some(ControllerState::Errored));

    binding.deactivate().await;
    assert_eq!(server.next_seen().await, Seen::Connected(1));
    assert_eq!(server.next_seen().await, Seen::Op(1, "SUB secret.create 1".into()));
    assert_eq!(server.next_seen().await, Seen::Disconnected(1));
}

#[tokio::test]
async fn pull_binding_buffers_in_order() {
    let server = FakeNats::start().await;
    let mut binding = LiveBinding::pull(
        context(&server),
        EnvelopeDecoder::<serde_json::Value>::new(),
        None,
    );
    binding.activate(topic("feedback.delete")).await;
    streaming(&binding).await;

    for id in 0..20 {
        server.publish(
            "feedback.delete",
            &format!(r#"{{"id":"{id}","timestamp":"2024-01-01T00:00:00Z","data":null}}"#),
        );
    }
    let mut changes = binding.strategy().subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        while binding.strategy().len() < 20 {
            changes.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    let got: Vec<String> = binding
        .strategy()
        .messages()
        .into_iter()
        .map(|m| m.value.id)
        .collect();
    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(got, expected);
    assert!(binding.strategy().latest_error().is_none());
    binding.deactivate().await;
}

#[tokio::test]
async fn unreachable_server_surfaces_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let ctx = LiveContext::new(
        Endpoint::parse(&format!("ws://{addr}")).unwrap(),
        Arc::new(NatsTransport::default()),
    );
    let mut binding = LiveBinding::pull(
        ctx,
        EnvelopeDecoder::<serde_json::Value>::new(),
        None,
    );
    let mut changes = binding.strategy().subscribe();
    binding.activate(topic("feedback.create")).await;

    tokio::time::timeout(Duration::from_secs(5), changes.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        binding.strategy().latest_error(),
        Some(LiveError::Connect { .. })
    ));
    assert!(binding.strategy().is_empty());
    binding.deactivate().await;
    assert_eq!(binding.state(), None);
}
