//! In-process broker.
//!
//! [`MemoryBroker`] routes published payloads to every matching
//! subscription of every open session, in publish order. It also carries
//! fault switches (refused connects, rejected topics, failing unsubscribe
//! and close, paused handshakes, dropped connections) and counters, so the
//! layers above can be exercised without a network.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use beacon_core::{ConnectionId, Endpoint, Scheme, Topic};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::transport::{
    Frame, SubscriptionHandle, SubscriptionId, Transport, TransportError, TransportSession,
};

// ─────────────────────────────────────────────────────────────────────────────
// Broker
// ─────────────────────────────────────────────────────────────────────────────

/// Shared in-process publish/subscribe broker. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    connect_gate: Gate,
    subscribe_gate: Gate,
    next_session: AtomicU64,
    next_sid: AtomicU64,
    connects: AtomicUsize,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    closes: AtomicUsize,
}

#[derive(Default)]
struct BrokerState {
    refuse_reason: Option<String>,
    rejected_topics: HashMap<String, String>,
    unsubscribe_failure: Option<String>,
    close_failure: Option<String>,
    sessions: HashMap<u64, SessionEntry>,
}

struct SessionEntry {
    open: Arc<AtomicBool>,
    subs: HashMap<u64, (Topic, mpsc::UnboundedSender<Frame>)>,
}

/// A pause switch operations wait on.
struct Gate(watch::Sender<bool>);

impl Default for Gate {
    fn default() -> Self {
        Self(watch::channel(false).0)
    }
}

impl Gate {
    fn set(&self, paused: bool) {
        let _ = self.0.send_replace(paused);
    }

    async fn pass(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// A [`Transport`] connecting to this broker.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
        }
    }

    /// Publish `payload` on `subject`. Returns how many subscriptions
    /// received it.
    pub fn publish(&self, subject: &Topic, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let state = self.inner.state.lock();
        let mut delivered = 0;
        for session in state.sessions.values() {
            for (topic, tx) in session.subs.values() {
                if topic.matches(subject) {
                    let frame = Frame {
                        subject: subject.clone(),
                        payload: payload.clone(),
                    };
                    if tx.send(frame).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }

    // ── Fault switches ──────────────────────────────────────────────────

    /// Refuse new connections with `reason`.
    pub fn refuse_connections(&self, reason: impl Into<String>) {
        self.inner.state.lock().refuse_reason = Some(reason.into());
    }

    /// Accept new connections again.
    pub fn accept_connections(&self) {
        self.inner.state.lock().refuse_reason = None;
    }

    /// Hold connection handshakes until [`resume_connections`](Self::resume_connections).
    pub fn pause_connections(&self) {
        self.inner.connect_gate.set(true);
    }

    /// Release held handshakes.
    pub fn resume_connections(&self) {
        self.inner.connect_gate.set(false);
    }

    /// Hold subscribe acknowledgements until [`resume_subscribes`](Self::resume_subscribes).
    pub fn pause_subscribes(&self) {
        self.inner.subscribe_gate.set(true);
    }

    /// Release held subscribes.
    pub fn resume_subscribes(&self) {
        self.inner.subscribe_gate.set(false);
    }

    /// Reject subscriptions whose topic is exactly `topic`.
    pub fn reject_topic(&self, topic: &str, reason: impl Into<String>) {
        let _ = self
            .inner
            .state
            .lock()
            .rejected_topics
            .insert(topic.to_owned(), reason.into());
    }

    /// Make every unsubscribe report `reason` (the subscription is still removed).
    pub fn fail_unsubscribe(&self, reason: impl Into<String>) {
        self.inner.state.lock().unsubscribe_failure = Some(reason.into());
    }

    /// Make every close report `reason` (the session is still closed).
    pub fn fail_close(&self, reason: impl Into<String>) {
        self.inner.state.lock().close_failure = Some(reason.into());
    }

    /// Sever every open session as if the network dropped. Subscription
    /// streams end; sessions report closed.
    pub fn drop_connections(&self) {
        let sessions: Vec<SessionEntry> = {
            let mut state = self.inner.state.lock();
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &sessions {
            session.open.store(false, Ordering::SeqCst);
        }
        debug!(count = sessions.len(), "memory broker dropped sessions");
    }

    // ── Counters ────────────────────────────────────────────────────────

    /// Sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    /// Subscriptions currently registered across all sessions.
    pub fn subscription_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .sessions
            .values()
            .map(|s| s.subs.len())
            .sum()
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Accepted subscribes so far.
    pub fn subscribe_count(&self) -> usize {
        self.inner.subscribes.load(Ordering::SeqCst)
    }

    /// Unsubscribe requests for live subscriptions so far.
    pub fn unsubscribe_count(&self) -> usize {
        self.inner.unsubscribes.load(Ordering::SeqCst)
    }

    /// Close requests for open sessions so far.
    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport and session
// ─────────────────────────────────────────────────────────────────────────────

/// [`Transport`] for `memory://` endpoints backed by a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn TransportSession>, TransportError> {
        if endpoint.scheme() != Scheme::Memory {
            return Err(TransportError::UnsupportedEndpoint(endpoint.to_string()));
        }
        let inner = &self.broker.inner;
        inner.connect_gate.pass().await;

        let mut state = inner.state.lock();
        if let Some(reason) = &state.refuse_reason {
            return Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: reason.clone(),
            });
        }
        let key = inner.next_session.fetch_add(1, Ordering::SeqCst);
        let open = Arc::new(AtomicBool::new(true));
        let _ = state.sessions.insert(
            key,
            SessionEntry {
                open: Arc::clone(&open),
                subs: HashMap::new(),
            },
        );
        let _ = inner.connects.fetch_add(1, Ordering::SeqCst);
        drop(state);

        let session = MemorySession {
            broker: self.broker.clone(),
            key,
            id: ConnectionId::new(),
            open,
        };
        debug!(connection = %session.id, %endpoint, "memory session opened");
        Ok(Arc::new(session))
    }
}

struct MemorySession {
    broker: MemoryBroker,
    key: u64,
    id: ConnectionId,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSession for MemorySession {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, topic: &Topic) -> Result<SubscriptionHandle, TransportError> {
        let inner = &self.broker.inner;
        inner.subscribe_gate.pass().await;

        let mut state = inner.state.lock();
        if let Some(reason) = state.rejected_topics.get(topic.as_str()) {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: reason.clone(),
            });
        }
        let Some(session) = state.sessions.get_mut(&self.key) else {
            return Err(TransportError::Closed);
        };
        let sid = inner.next_sid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = session.subs.insert(sid, (topic.clone(), tx));
        let _ = inner.subscribes.fetch_add(1, Ordering::SeqCst);

        Ok(SubscriptionHandle {
            id: SubscriptionId(sid),
            topic: topic.clone(),
            frames: UnboundedReceiverStream::new(rx).boxed(),
        })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        let inner = &self.broker.inner;
        let mut state = inner.state.lock();
        let removed = state
            .sessions
            .get_mut(&self.key)
            .and_then(|s| s.subs.remove(&id.0))
            .is_some();
        if !removed {
            return Ok(());
        }
        let _ = inner.unsubscribes.fetch_add(1, Ordering::SeqCst);
        match &state.unsubscribe_failure {
            Some(reason) => Err(TransportError::Unsubscribe(reason.clone())),
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let inner = &self.broker.inner;
        let mut state = inner.state.lock();
        let _ = state.sessions.remove(&self.key);
        let _ = inner.closes.fetch_add(1, Ordering::SeqCst);
        debug!(connection = %self.id, "memory session closed");
        match &state.close_failure {
            Some(reason) => Err(TransportError::Close(reason.clone())),
            None => Ok(()),
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.broker.inner.state.lock().sessions.remove(&self.key);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn endpoint() -> Endpoint {
        Endpoint::parse("memory://test").unwrap()
    }

    fn topic(s: &str) -> Topic {
        Topic::new(s).unwrap()
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscriptions_in_order() {
        let broker = MemoryBroker::new();
        let session = broker.transport().connect(&endpoint()).await.unwrap();
        let mut exact = session.subscribe(&topic("feedback.create")).await.unwrap();
        let mut wild = session.subscribe(&topic("feedback.>")).await.unwrap();
        let mut other = session.subscribe(&topic("user.create")).await.unwrap();

        assert_eq!(broker.publish(&topic("feedback.create"), "1"), 2);
        assert_eq!(broker.publish(&topic("feedback.create"), "2"), 2);

        assert_eq!(exact.frames.next().await.unwrap().payload, "1");
        assert_eq!(exact.frames.next().await.unwrap().payload, "2");
        let frame = wild.frames.next().await.unwrap();
        assert_eq!(frame.subject.as_str(), "feedback.create");
        assert_eq!(frame.payload, "1");

        session.close().await.unwrap();
        assert!(other.frames.next().await.is_none());
    }

    #[tokio::test]
    async fn session_debug_shows_id_and_state() {
        let broker = MemoryBroker::new();
        let session = broker.transport().connect(&endpoint()).await.unwrap();
        let debug = format!("{session:?}");
        assert!(debug.contains(session.id().as_str()));
        assert!(debug.contains("open: true"));
        session.close().await.unwrap();
        assert!(format!("{session:?}").contains("open: false"));
    }

    #[tokio::test]
    async fn rejects_foreign_scheme() {
        let broker = MemoryBroker::new();
        let ws = Endpoint::parse("ws://localhost:1").unwrap();
        assert_matches!(
            broker.transport().connect(&ws).await,
            Err(TransportError::UnsupportedEndpoint(_))
        );
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        let broker = MemoryBroker::new();
        broker.refuse_connections("no route");
        assert_matches!(
            broker.transport().connect(&endpoint()).await,
            Err(TransportError::Connect { reason, .. }) if reason == "no route"
        );
        broker.accept_connections();
        assert!(broker.transport().connect(&endpoint()).await.is_ok());
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn rejected_topic_is_reported() {
        let broker = MemoryBroker::new();
        broker.reject_topic("secret.create", "Permissions Violation");
        let session = broker.transport().connect(&endpoint()).await.unwrap();
        assert_matches!(
            session.subscribe(&topic("secret.create")).await,
            Err(TransportError::Subscribe { .. })
        );
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_ends_stream_and_is_idempotent() {
        let broker = MemoryBroker::new();
        let session = broker.transport().connect(&endpoint()).await.unwrap();
        let mut handle = session.subscribe(&topic("a.b")).await.unwrap();

        session.unsubscribe(handle.id).await.unwrap();
        session.unsubscribe(handle.id).await.unwrap();
        assert!(handle.frames.next().await.is_none());
        assert_eq!(broker.unsubscribe_count(), 1);
        assert_eq!(broker.publish(&topic("a.b"), "x"), 0);
    }

    #[tokio::test]
    async fn failing_unsubscribe_still_removes() {
        let broker = MemoryBroker::new();
        broker.fail_unsubscribe("server gone");
        let session = broker.transport().connect(&endpoint()).await.unwrap();
        let handle = session.subscribe(&topic("a.b")).await.unwrap();
        assert_matches!(
            session.unsubscribe(handle.id).await,
            Err(TransportError::Unsubscribe(_))
        );
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn close_is_counted_once() {
        let broker = MemoryBroker::new();
        broker.fail_close("reset by peer");
        let session = broker.transport().connect(&endpoint()).await.unwrap();
        assert_matches!(session.close().await, Err(TransportError::Close(_)));
        session.close().await.unwrap();
        assert_eq!(broker.close_count(), 1);
        assert!(!session.is_open());
        assert_matches!(
            session.subscribe(&topic("a.b")).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn dropped_connections_end_streams() {
        let broker = MemoryBroker::new();
        let session = broker.transport().connect(&endpoint()).await.unwrap();
        let mut handle = session.subscribe(&topic("a.*")).await.unwrap();
        broker.drop_connections();
        assert!(handle.frames.next().await.is_none());
        assert!(!session.is_open());
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn paused_connect_waits_for_resume() {
        let broker = MemoryBroker::new();
        broker.pause_connections();
        let transport = broker.transport();
        let pending = tokio::spawn(async move { transport.connect(&endpoint()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        broker.resume_connections();
        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn dropping_session_deregisters() {
        let broker = MemoryBroker::new();
        let session = broker.transport().connect(&endpoint()).await.unwrap();
        assert_eq!(broker.open_sessions(), 1);
        drop(session);
        assert_eq!(broker.open_sessions(), 0);
        assert_eq!(broker.close_count(), 0);
    }
}
