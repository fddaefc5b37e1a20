//! NATS-over-WebSocket sessions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use beacon_core::{ConnectionId, Endpoint, Scheme, Topic};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, trace, warn};

use super::proto::{ClientOp, ConnectInfo, NatsCodec, ServerInfo, ServerOp};
use crate::transport::{
    Frame, SubscriptionHandle, SubscriptionId, Transport, TransportError, TransportSession,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// Connection options for [`NatsTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NatsOptions {
    /// Client name reported in `CONNECT`.
    pub name: String,
    /// Username.
    pub user: Option<String>,
    /// Password.
    pub pass: Option<String>,
    /// Deadline for the WebSocket upgrade plus protocol handshake.
    pub connect_timeout: Duration,
    /// Deadline for each `+OK`/`-ERR` acknowledgement.
    pub ack_timeout: Duration,
    /// Interval between client keepalive pings.
    pub ping_interval: Duration,
    /// Unanswered pings tolerated before the connection is declared stale.
    pub max_pings_outstanding: u32,
}

impl Default for NatsOptions {
    fn default() -> Self {
        Self {
            name: "beacon".into(),
            user: None,
            pass: None,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            max_pings_outstanding: 2,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// [`Transport`] for `ws://` and `wss://` endpoints speaking NATS.
#[derive(Clone, Debug, Default)]
pub struct NatsTransport {
    options: NatsOptions,
}

impl NatsTransport {
    /// Create a transport with `options`.
    pub fn new(options: NatsOptions) -> Self {
        Self { options }
    }

    /// Options in use.
    pub fn options(&self) -> &NatsOptions {
        &self.options
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn TransportSession>, TransportError> {
        if endpoint.scheme() == Scheme::Memory {
            return Err(TransportError::UnsupportedEndpoint(endpoint.to_string()));
        }
        let established =
            tokio::time::timeout(self.options.connect_timeout, handshake(endpoint, &self.options))
                .await
                .map_err(|_| TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: format!(
                        "handshake timed out after {}ms",
                        self.options.connect_timeout.as_millis()
                    ),
                })??;

        let id = ConnectionId::new();
        let open = Arc::new(AtomicBool::new(true));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        info!(
            connection = %id,
            %endpoint,
            server = %established.server.server_name,
            version = %established.server.version,
            "nats connection established"
        );

        let task = ConnectionTask {
            id: id.clone(),
            ws: established.ws,
            codec: established.codec,
            buf: established.buf,
            cmd_rx,
            open: Arc::clone(&open),
            ack_timeout: self.options.ack_timeout,
            ping_interval: self.options.ping_interval,
            max_pings_outstanding: self.options.max_pings_outstanding,
            subs: HashMap::new(),
            pending: VecDeque::new(),
            next_sid: 1,
            pings_outstanding: 0,
        };
        drop(tokio::spawn(task.run()));

        Ok(Arc::new(NatsSession { id, cmd_tx, open }))
    }
}

struct Established {
    ws: WsStream,
    codec: NatsCodec,
    buf: BytesMut,
    server: ServerInfo,
}

async fn handshake(endpoint: &Endpoint, options: &NatsOptions) -> Result<Established, TransportError> {
    let fail = |reason: String| TransportError::Connect {
        endpoint: endpoint.to_string(),
        reason,
    };

    let (mut ws, _response) = tokio_tungstenite::connect_async(endpoint.as_str())
        .await
        .map_err(|e| fail(e.to_string()))?;
    let mut codec = NatsCodec::new();
    let mut buf = BytesMut::new();

    let server = match next_op(&mut ws, &mut codec, &mut buf).await.map_err(fail)? {
        ServerOp::Info(info) => *info,
        other => return Err(fail(format!("expected INFO, got {other:?}"))),
    };
    codec.set_max_payload(server.max_payload);
    debug!(%endpoint, server_id = %server.server_id, "received server INFO");

    let mut connect = ConnectInfo::new(options.name.clone());
    connect.user.clone_from(&options.user);
    connect.pass.clone_from(&options.pass);
    connect.tls_required = endpoint.is_secure();

    let mut out = BytesMut::new();
    codec
        .encode(ClientOp::Connect(connect), &mut out)
        .and_then(|()| codec.encode(ClientOp::Ping, &mut out))
        .map_err(|e| fail(e.to_string()))?;
    ws.send(Message::Binary(out.freeze()))
        .await
        .map_err(|e| fail(e.to_string()))?;

    loop {
        match next_op(&mut ws, &mut codec, &mut buf).await.map_err(fail)? {
            ServerOp::Pong => break,
            ServerOp::Ok | ServerOp::Info(_) => {}
            ServerOp::Ping => {
                let mut out = BytesMut::new();
                codec
                    .encode(ClientOp::Pong, &mut out)
                    .map_err(|e| fail(e.to_string()))?;
                ws.send(Message::Binary(out.freeze()))
                    .await
                    .map_err(|e| fail(e.to_string()))?;
            }
            ServerOp::Err(reason) => return Err(fail(reason)),
            ServerOp::Msg { .. } => return Err(fail("MSG received before handshake completed".into())),
        }
    }

    Ok(Established {
        ws,
        codec,
        buf,
        server,
    })
}

/// Read until one complete op is buffered.
async fn next_op(
    ws: &mut WsStream,
    codec: &mut NatsCodec,
    buf: &mut BytesMut,
) -> Result<ServerOp, String> {
    loop {
        if let Some(op) = codec.decode(buf).map_err(|e| e.to_string())? {
            return Ok(op);
        }
        match ws.next().await {
            Some(Ok(msg)) => {
                if !append_frame(buf, msg) {
                    return Err("server closed connection".into());
                }
            }
            Some(Err(e)) => return Err(e.to_string()),
            None => return Err("server closed connection".into()),
        }
    }
}

/// Append a data frame to `buf`. Returns `false` for a close frame.
fn append_frame(buf: &mut BytesMut, msg: Message) -> bool {
    match msg {
        Message::Binary(data) => buf.extend_from_slice(&data),
        Message::Text(text) => buf.extend_from_slice(text.as_str().as_bytes()),
        Message::Close(_) => return false,
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
    }
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Session handle
// ─────────────────────────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, TransportError>>;

enum Command {
    Subscribe {
        topic: Topic,
        reply: Reply<SubscriptionHandle>,
    },
    Unsubscribe {
        sid: u64,
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
}

struct NatsSession {
    id: ConnectionId,
    cmd_tx: mpsc::UnboundedSender<Command>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSession for NatsSession {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, topic: &Topic) -> Result<SubscriptionHandle, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                topic: topic.clone(),
                reply,
            })
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Unsubscribe { sid: id.0, reply })
            .is_err()
        {
            // the connection is gone and took its subscriptions with it
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close { reply }).is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection task
// ─────────────────────────────────────────────────────────────────────────────

enum PendingAck {
    Sub {
        sid: u64,
        topic: Topic,
        frames: mpsc::UnboundedReceiver<Frame>,
        reply: Reply<SubscriptionHandle>,
    },
    Unsub {
        sid: u64,
        reply: Option<Reply<()>>,
    },
}

struct Pending {
    ack: PendingAck,
    deadline: Instant,
}

struct ConnectionTask {
    id: ConnectionId,
    ws: WsStream,
    codec: NatsCodec,
    buf: BytesMut,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    open: Arc<AtomicBool>,
    ack_timeout: Duration,
    ping_interval: Duration,
    max_pings_outstanding: u32,
    subs: HashMap<u64, mpsc::UnboundedSender<Frame>>,
    pending: VecDeque<Pending>,
    next_sid: u64,
    pings_outstanding: u32,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut ping = tokio::time::interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut close_reply = None;

        let reason: String = loop {
            let ack_deadline = self.pending.front().map(|p| p.deadline);
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => match self.handle_command(cmd).await {
                        Ok(Some(reply)) => {
                            close_reply = Some(reply);
                            break "closed by client".into();
                        }
                        Ok(None) => {}
                        Err(e) => break e,
                    },
                    None => break "session handle dropped".into(),
                },
                msg = self.ws.next() => match msg {
                    Some(Ok(msg)) => {
                        if let Err(e) = self.handle_ws(msg).await {
                            break e;
                        }
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => break "server closed connection".into(),
                },
                _ = ping.tick() => {
                    if let Err(e) = self.keepalive().await {
                        break e;
                    }
                }
                () = ack_timer(ack_deadline) => {
                    break format!(
                        "acknowledgement timed out after {}ms",
                        self.ack_timeout.as_millis()
                    );
                }
            }
        };

        self.shutdown(&reason, close_reply).await;
    }

    /// Returns the reply channel when the command asks to close.
    async fn handle_command(&mut self, cmd: Command) -> Result<Option<Reply<()>>, String> {
        match cmd {
            Command::Subscribe { topic, reply } => {
                let sid = self.next_sid;
                self.next_sid += 1;
                self.send(ClientOp::Sub {
                    subject: topic.to_string(),
                    sid,
                })
                .await?;
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = self.subs.insert(sid, tx);
                debug!(connection = %self.id, %topic, sid, "SUB sent");
                self.push_pending(PendingAck::Sub {
                    sid,
                    topic,
                    frames: rx,
                    reply,
                });
            }
            Command::Unsubscribe { sid, reply } => {
                if self.subs.remove(&sid).is_none() {
                    let _ = reply.send(Ok(()));
                    return Ok(None);
                }
                self.send(ClientOp::Unsub { sid }).await?;
                debug!(connection = %self.id, sid, "UNSUB sent");
                self.push_pending(PendingAck::Unsub {
                    sid,
                    reply: Some(reply),
                });
            }
            Command::Close { reply } => return Ok(Some(reply)),
        }
        Ok(None)
    }

    async fn handle_ws(&mut self, msg: Message) -> Result<(), String> {
        if !append_frame(&mut self.buf, msg) {
            return Err("server closed connection".into());
        }
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(op)) => self.handle_op(op).await?,
                Ok(None) => return Ok(()),
                Err(e) => return Err(format!("protocol error: {e}")),
            }
        }
    }

    async fn handle_op(&mut self, op: ServerOp) -> Result<(), String> {
        match op {
            ServerOp::Msg {
                subject,
                sid,
                payload,
                ..
            } => self.route(subject, sid, payload).await,
            ServerOp::Ping => self.send(ClientOp::Pong).await,
            ServerOp::Pong => {
                self.pings_outstanding = 0;
                Ok(())
            }
            ServerOp::Ok => self.complete_ack(None).await,
            ServerOp::Err(reason) => {
                if self.pending.is_empty() {
                    warn!(connection = %self.id, %reason, "server error");
                } else {
                    self.complete_ack(Some(reason.clone())).await?;
                }
                if is_fatal(&reason) {
                    return Err(reason);
                }
                Ok(())
            }
            ServerOp::Info(info) => {
                debug!(connection = %self.id, server_id = %info.server_id, "async INFO");
                self.codec.set_max_payload(info.max_payload);
                Ok(())
            }
        }
    }

    async fn route(&mut self, subject: String, sid: u64, payload: bytes::Bytes) -> Result<(), String> {
        let Some(tx) = self.subs.get(&sid) else {
            trace!(connection = %self.id, sid, "MSG for unknown sid dropped");
            return Ok(());
        };
        let subject = match Topic::new(subject) {
            Ok(subject) => subject,
            Err(e) => {
                warn!(connection = %self.id, sid, error = %e, "MSG with invalid subject dropped");
                return Ok(());
            }
        };
        if tx.send(Frame { subject, payload }).is_err() {
            self.abandon(sid).await?;
        }
        Ok(())
    }

    /// Pop the oldest pending request and resolve it.
    async fn complete_ack(&mut self, error: Option<String>) -> Result<(), String> {
        let Some(front) = self.pending.pop_front() else {
            trace!(connection = %self.id, "unsolicited acknowledgement");
            return Ok(());
        };
        match (front.ack, error) {
            (
                PendingAck::Sub {
                    sid,
                    topic,
                    frames,
                    reply,
                },
                None,
            ) => {
                let handle = SubscriptionHandle {
                    id: SubscriptionId(sid),
                    topic,
                    frames: UnboundedReceiverStream::new(frames).boxed(),
                };
                if reply.send(Ok(handle)).is_err() {
                    self.abandon(sid).await?;
                }
            }
            (PendingAck::Sub { sid, topic, reply, .. }, Some(reason)) => {
                let _ = self.subs.remove(&sid);
                warn!(connection = %self.id, %topic, %reason, "subscribe rejected");
                let _ = reply.send(Err(TransportError::Subscribe {
                    topic: topic.to_string(),
                    reason,
                }));
            }
            (PendingAck::Unsub { reply, .. }, None) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            (PendingAck::Unsub { sid, reply }, Some(reason)) => {
                warn!(connection = %self.id, sid, %reason, "unsubscribe rejected");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(TransportError::Unsubscribe(reason)));
                }
            }
        }
        Ok(())
    }

    /// Unsubscribe a sid nobody is listening to any more.
    async fn abandon(&mut self, sid: u64) -> Result<(), String> {
        let _ = self.subs.remove(&sid);
        self.send(ClientOp::Unsub { sid }).await?;
        debug!(connection = %self.id, sid, "UNSUB sent for abandoned subscription");
        self.push_pending(PendingAck::Unsub { sid, reply: None });
        Ok(())
    }

    async fn keepalive(&mut self) -> Result<(), String> {
        if self.pings_outstanding >= self.max_pings_outstanding {
            return Err(format!(
                "stale connection: {} pings unanswered",
                self.pings_outstanding
            ));
        }
        self.pings_outstanding += 1;
        self.send(ClientOp::Ping).await
    }

    fn push_pending(&mut self, ack: PendingAck) {
        self.pending.push_back(Pending {
            ack,
            deadline: Instant::now() + self.ack_timeout,
        });
    }

    async fn send(&mut self, op: ClientOp) -> Result<(), String> {
        let mut out = BytesMut::new();
        self.codec.encode(op, &mut out).map_err(|e| e.to_string())?;
        self.ws
            .send(Message::Binary(out.freeze()))
            .await
            .map_err(|e| format!("write failed: {e}"))
    }

    async fn shutdown(mut self, reason: &str, close_reply: Option<Reply<()>>) {
        self.open.store(false, Ordering::SeqCst);
        for pending in self.pending.drain(..) {
            match pending.ack {
                PendingAck::Sub { reply, .. } => {
                    let _ = reply.send(Err(TransportError::Closed));
                }
                PendingAck::Unsub { reply, .. } => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(TransportError::Closed));
                    }
                }
            }
        }
        let dropped_subs = self.subs.len();
        self.subs.clear();

        let result = match self.ws.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(TransportError::Close(e.to_string())),
        };

        match close_reply {
            Some(reply) => {
                info!(connection = %self.id, "nats connection closed");
                let _ = reply.send(result);
            }
            None => {
                warn!(connection = %self.id, reason, subscriptions = dropped_subs, "nats connection lost");
            }
        }
    }
}

async fn ack_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Whether the server drops the connection after sending this `-ERR`.
fn is_fatal(reason: &str) -> bool {
    let lower = reason.to_ascii_lowercase();
    !(lower.starts_with("permissions violation") || lower.starts_with("invalid subject"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::net::TcpListener;

    #[test]
    fn permission_errors_are_not_fatal() {
        assert!(!is_fatal("Permissions Violation for Subscription to secret.>"));
        assert!(!is_fatal("Invalid Subject"));
        assert!(is_fatal("Stale Connection"));
        assert!(is_fatal("Authorization Violation"));
    }

    #[test]
    fn append_frame_accepts_text_and_binary() {
        let mut buf = BytesMut::new();
        assert!(append_frame(&mut buf, Message::text("PI")));
        assert!(append_frame(&mut buf, Message::binary(b"NG\r\n".to_vec())));
        assert!(append_frame(&mut buf, Message::Ping(bytes::Bytes::new())));
        assert!(!append_frame(&mut buf, Message::Close(None)));
        assert_eq!(&buf[..], b"PING\r\n");
    }

    #[tokio::test]
    async fn memory_endpoint_is_unsupported() {
        let endpoint = Endpoint::parse("memory://x").unwrap();
        assert_matches!(
            NatsTransport::default().connect(&endpoint).await,
            Err(TransportError::UnsupportedEndpoint(_))
        );
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let endpoint = Endpoint::parse(&format!("ws://{addr}")).unwrap();
        assert_matches!(
            NatsTransport::default().connect(&endpoint).await,
            Err(TransportError::Connect { .. })
        );
    }

    #[tokio::test]
    async fn silent_server_hits_connect_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            std::future::pending::<()>().await;
        });
        let transport = NatsTransport::new(NatsOptions {
            connect_timeout: Duration::from_millis(100),
            ..NatsOptions::default()
        });
        let endpoint = Endpoint::parse(&format!("ws://{addr}")).unwrap();
        assert_matches!(
            transport.connect(&endpoint).await,
            Err(TransportError::Connect { reason, .. }) if reason.contains("timed out")
        );
    }

    #[tokio::test]
    async fn oversized_msg_closes_session_without_panicking() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::text("INFO {\"server_id\":\"t\",\"max_payload\":8}\r\n"))
                .await
                .unwrap();
            let mut seen = String::new();
            while !seen.contains("PING\r\n") {
                match ws.next().await {
                    Some(Ok(msg)) => seen.push_str(&String::from_utf8_lossy(&msg.into_data())),
                    _ => return,
                }
            }
            ws.send(Message::text("PONG\r\n")).await.unwrap();
            ws.send(Message::text("MSG feedback.create 1 9\r\n")).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let endpoint = Endpoint::parse(&format!("ws://{addr}")).unwrap();
        let session = NatsTransport::default().connect(&endpoint).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.is_open() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_matches!(
            session.subscribe(&Topic::new("feedback.create").unwrap()).await,
            Err(TransportError::Closed)
        );
        server.await.unwrap();
    }
}
