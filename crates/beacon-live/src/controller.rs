//! Subscription controllers.
//!
//! A controller drives one (topic, strategy) binding through
//! `Idle → Connecting → Subscribing → Streaming → Closing → Closed`, with
//! `Errored` reached when connecting or subscribing fails (or the stream
//! ends and no reconnect is allowed). It runs as one task; the
//! [`ControllerHandle`] observes it and tears it down.
//!
//! Teardown is cooperative. Cancellation is checked before every frame, so
//! no frame read after the signal reaches the strategy. The exit path
//! unsubscribes, then releases the supervisor lease (closing the connection
//! when nothing else holds it), then reports `Closed`. Teardown failures are
//! logged and never stop the controller reaching `Closed`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use beacon_core::{Message, MessageDecoder, ReconnectPolicy, Topic};
use beacon_transport::{Frame, SubscriptionHandle, SubscriptionId};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::delivery::DeliveryStrategy;
use crate::error::{ConnectError, LiveError};
use crate::pool::SupervisorLease;
use crate::supervisor::Connection;

// ─────────────────────────────────────────────────────────────────────────────
// State and stats
// ─────────────────────────────────────────────────────────────────────────────

/// Controller lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    /// Spawned, not yet started.
    Idle,
    /// Waiting for the connection.
    Connecting,
    /// Waiting for the transport to accept the topic.
    Subscribing,
    /// Consuming frames.
    Streaming,
    /// Unsubscribing and releasing the connection.
    Closing,
    /// Torn down. Terminal.
    Closed,
    /// Failed; waiting for teardown.
    Errored,
}

impl ControllerState {
    /// Whether the controller will never change state again.
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Counters for one controller.
#[derive(Debug, Default)]
pub struct ControllerStats {
    delivered: AtomicU64,
    decode_failures: AtomicU64,
    discarded: AtomicU64,
    reconnects: AtomicU64,
}

impl ControllerStats {
    /// Messages handed to the strategy.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Frames skipped because they failed to decode.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::SeqCst)
    }

    /// Frames read after teardown was requested and dropped.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::SeqCst)
    }

    /// Reconnect attempts made.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn bump(counter: &AtomicU64) {
        let _ = counter.fetch_add(1, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Controller
// ─────────────────────────────────────────────────────────────────────────────

/// One topic subscription feeding one delivery strategy.
pub struct SubscriptionController<D: MessageDecoder> {
    topic: Topic,
    lease: SupervisorLease,
    decoder: D,
    strategy: Arc<dyn DeliveryStrategy<D::Output>>,
    reconnect: ReconnectPolicy,
}

impl<D: MessageDecoder> SubscriptionController<D> {
    /// Bind `topic` to `strategy` over the leased connection.
    pub fn new(
        topic: Topic,
        lease: SupervisorLease,
        decoder: D,
        strategy: Arc<dyn DeliveryStrategy<D::Output>>,
    ) -> Self {
        Self {
            topic,
            lease,
            decoder,
            strategy,
            reconnect: ReconnectPolicy::disabled(),
        }
    }

    /// Reconnect after connect failures and stream end per `policy`.
    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Start the controller task.
    pub fn spawn(self) -> ControllerHandle {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ControllerState::Idle);
        let stats = Arc::new(ControllerStats::default());
        let topic = self.topic.clone();

        let task = ControllerTask {
            topic: self.topic,
            lease: self.lease,
            decoder: self.decoder,
            strategy: self.strategy,
            reconnect: self.reconnect,
            cancel: cancel.clone(),
            state: state_tx,
            stats: Arc::clone(&stats),
        };
        let join = tokio::spawn(task.run());

        ControllerHandle {
            topic,
            cancel,
            state: state_rx,
            stats,
            join: Mutex::new(Some(join)),
        }
    }
}

/// Observes and tears down a running controller.
///
/// Dropping the handle requests teardown without waiting for it.
pub struct ControllerHandle {
    topic: Topic,
    cancel: CancellationToken,
    state: watch::Receiver<ControllerState>,
    stats: Arc<ControllerStats>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ControllerHandle {
    /// The subscribed topic.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Current state.
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<ControllerState> {
        self.state.clone()
    }

    /// Counters.
    pub fn stats(&self) -> &Arc<ControllerStats> {
        &self.stats
    }

    /// Wait until the state satisfies `predicate`. Returns the matching
    /// state, or `Closed` if the controller finished without matching.
    pub async fn wait_for(&self, predicate: impl Fn(ControllerState) -> bool) -> ControllerState {
        let mut rx = self.state.clone();
        match rx.wait_for(|s| predicate(*s)).await {
            Ok(state) => *state,
            Err(_) => ControllerState::Closed,
        }
    }

    /// Whether teardown has been requested.
    pub fn is_torn_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tear the controller down and wait until it is `Closed`.
    ///
    /// Idempotent: later and concurrent calls wait for the same teardown.
    /// Once this returns, the strategy receives nothing further.
    pub async fn teardown(&self) {
        self.cancel.cancel();
        let join = self.join.lock().take();
        if let Some(join) = join {
            if let Err(error) = join.await {
                warn!(topic = %self.topic, %error, "controller task failed");
            }
        }
        let _ = self.wait_for(ControllerState::is_terminal).await;
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerHandle")
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task
// ─────────────────────────────────────────────────────────────────────────────

/// How the active phase ended.
enum Exit {
    /// Teardown requested; the subscription to remove, if one is live.
    Cancelled(Option<(Connection, SubscriptionId)>),
    /// Terminal failure to surface.
    Failed(LiveError),
}

struct ControllerTask<D: MessageDecoder> {
    topic: Topic,
    lease: SupervisorLease,
    decoder: D,
    strategy: Arc<dyn DeliveryStrategy<D::Output>>,
    reconnect: ReconnectPolicy,
    cancel: CancellationToken,
    state: watch::Sender<ControllerState>,
    stats: Arc<ControllerStats>,
}

impl<D: MessageDecoder> ControllerTask<D> {
    async fn run(self) {
        let active = match self.stream().await {
            Exit::Cancelled(active) => active,
            Exit::Failed(error) => {
                warn!(topic = %self.topic, kind = error.kind(), %error, "live subscription failed");
                self.set_state(ControllerState::Errored);
                self.strategy.deliver_error(error);
                self.cancel.cancelled().await;
                None
            }
        };
        self.finish(active).await;
    }

    /// Connect, subscribe and consume until cancelled or failed.
    async fn stream(&self) -> Exit {
        let supervisor = self.lease.supervisor();
        let mut failures: u32 = 0;
        let mut sequence: u64 = 0;

        loop {
            self.set_state(ControllerState::Connecting);
            let Some(connected) = self.until_cancelled(supervisor.connect()).await else {
                return Exit::Cancelled(None);
            };
            let conn = match connected {
                Ok(conn) => conn,
                Err(ConnectError::Closed) => {
                    return Exit::Failed(self.connect_error(ConnectError::Closed));
                }
                Err(error) => match self.backoff(&mut failures) {
                    Some(delay) => {
                        warn!(topic = %self.topic, %error, attempt = failures, ?delay, "connect failed, retrying");
                        if self.until_cancelled(tokio::time::sleep(delay)).await.is_none() {
                            return Exit::Cancelled(None);
                        }
                        continue;
                    }
                    None => return Exit::Failed(self.connect_error(error)),
                },
            };

            self.set_state(ControllerState::Subscribing);
            let Some(subscribed) = self.until_cancelled(conn.subscribe(&self.topic)).await else {
                return Exit::Cancelled(None);
            };
            let SubscriptionHandle { id, mut frames, .. } = match subscribed {
                Ok(handle) => handle,
                Err(cause) => {
                    return Exit::Failed(LiveError::Subscribe {
                        topic: self.topic.clone(),
                        cause,
                    });
                }
            };

            self.set_state(ControllerState::Streaming);
            info!(topic = %self.topic, connection = %conn.id(), sid = %id, "streaming");
            failures = 0;

            loop {
                let next = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Exit::Cancelled(Some((conn, id))),
                    next = frames.next() => next,
                };
                let Some(frame) = next else {
                    break;
                };
                if self.cancel.is_cancelled() {
                    ControllerStats::bump(&self.stats.discarded);
                    return Exit::Cancelled(Some((conn, id)));
                }
                self.process(frame, sequence);
                sequence += 1;
            }

            // the transport ended the stream
            match self.backoff(&mut failures) {
                Some(delay) => {
                    warn!(topic = %self.topic, connection = %conn.id(), attempt = failures, ?delay, "stream ended, reconnecting");
                    supervisor.invalidate(conn.generation()).await;
                    if self.until_cancelled(tokio::time::sleep(delay)).await.is_none() {
                        return Exit::Cancelled(None);
                    }
                }
                None => {
                    return Exit::Failed(LiveError::StreamEnded {
                        topic: self.topic.clone(),
                    });
                }
            }
        }
    }

    /// Decode one frame and hand it on. Undecodable frames are counted,
    /// logged and skipped.
    fn process(&self, frame: Frame, sequence: u64) {
        match self.decoder.decode(&frame.payload) {
            Ok(value) => {
                ControllerStats::bump(&self.stats.delivered);
                self.strategy.deliver(Message {
                    topic: frame.subject,
                    sequence,
                    raw: frame.payload,
                    value,
                });
            }
            Err(failure) => {
                ControllerStats::bump(&self.stats.decode_failures);
                warn!(
                    topic = %frame.subject,
                    sequence,
                    kind = %failure.kind,
                    preview = %failure.preview,
                    error = %failure.reason,
                    "skipping undecodable frame"
                );
                self.strategy.decode_failed(&frame.subject, sequence, &failure);
            }
        }
    }

    /// Unsubscribe, release the connection, report `Closed`.
    async fn finish(self, active: Option<(Connection, SubscriptionId)>) {
        self.set_state(ControllerState::Closing);
        if let Some((conn, id)) = active {
            if let Err(error) = conn.unsubscribe(id).await {
                warn!(topic = %self.topic, sid = %id, %error, "unsubscribe failed during teardown");
            }
        }
        let topic = self.topic;
        if let Err(error) = self.lease.release().await {
            warn!(%topic, %error, "close failed during teardown");
        }
        let _ = self.state.send_replace(ControllerState::Closed);
        debug!(%topic, "controller closed");
    }

    fn backoff(&self, failures: &mut u32) -> Option<Duration> {
        let delay = self.reconnect.delay_for_attempt(*failures)?;
        *failures += 1;
        ControllerStats::bump(&self.stats.reconnects);
        Some(delay)
    }

    fn connect_error(&self, cause: ConnectError) -> LiveError {
        LiveError::Connect {
            endpoint: self.lease.supervisor().endpoint().to_string(),
            cause,
        }
    }

    async fn until_cancelled<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            output = future => Some(output),
        }
    }

    fn set_state(&self, state: ControllerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(topic = %self.topic, from = %previous, to = %state, "controller state");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::PullDelivery;
    use crate::supervisor::ConnectionSupervisor;
    use assert_matches::assert_matches;
    use beacon_core::{DecodeFailure, Endpoint, Envelope, EnvelopeDecoder};
    use beacon_transport::MemoryBroker;
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Event {
        Value(String),
        DecodeFailed(u64),
        Error(LiveError),
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Event>,
    }

    impl DeliveryStrategy<Envelope> for Recorder {
        fn deliver(&self, message: Message<Envelope>) {
            let _ = self.tx.send(Event::Value(message.value.id));
        }

        fn deliver_error(&self, error: LiveError) {
            let _ = self.tx.send(Event::Error(error));
        }

        fn decode_failed(&self, _topic: &Topic, sequence: u64, _failure: &DecodeFailure) {
            let _ = self.tx.send(Event::DecodeFailed(sequence));
        }
    }

    fn topic(s: &str) -> Topic {
        Topic::new(s).unwrap()
    }

    fn frame(id: u32) -> String {
        format!(r#"{{"id":"{id}","timestamp":"2024-01-01T00:00:00Z","data":{{}}}}"#)
    }

    fn lease(broker: &MemoryBroker) -> (ConnectionSupervisor, SupervisorLease) {
        let sup = ConnectionSupervisor::new(
            Endpoint::parse("memory://test").unwrap(),
            Arc::new(broker.transport()),
        );
        (sup.clone(), SupervisorLease::dedicated(sup))
    }

    fn spawn_recorder(
        broker: &MemoryBroker,
        on: &str,
    ) -> (ControllerHandle, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_, lease) = lease(broker);
        let handle = SubscriptionController::new(
            topic(on),
            lease,
            EnvelopeDecoder::<serde_json::Value>::new(),
            Arc::new(Recorder { tx }),
        )
        .spawn();
        (handle, rx)
    }

    async fn streaming(handle: &ControllerHandle) {
        assert_eq!(
            handle.wait_for(|s| s == ControllerState::Streaming).await,
            ControllerState::Streaming
        );
    }

    #[tokio::test]
    async fn example_sequence_skips_truncated_frame() {
        let broker = MemoryBroker::new();
        let (handle, mut rx) = spawn_recorder(&broker, "feedback.create");
        streaming(&handle).await;

        let subject = topic("feedback.create");
        let _ = broker.publish(
            &subject,
            r#"{"id":"1","timestamp":"2024-01-01T00:00:00Z","data":{"action":"created"}}"#,
        );
        let _ = broker.publish(&subject, r#"{"id":"2""#);
        let _ = broker.publish(
            &subject,
            r#"{"id":"3","timestamp":"2024-01-01T00:00:01Z","data":{}}"#,
        );

        assert_eq!(rx.recv().await, Some(Event::Value("1".into())));
        assert_eq!(rx.recv().await, Some(Event::DecodeFailed(1)));
        assert_eq!(rx.recv().await, Some(Event::Value("3".into())));
        assert_eq!(handle.state(), ControllerState::Streaming);
        assert_eq!(handle.stats().delivered(), 2);
        assert_eq!(handle.stats().decode_failures(), 1);
        handle.teardown().await;
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let broker = MemoryBroker::new();
        let (handle, _rx) = spawn_recorder(&broker, "updates.topic");
        streaming(&handle).await;

        handle.teardown().await;
        handle.teardown().await;
        assert_eq!(handle.state(), ControllerState::Closed);
        assert_eq!(broker.unsubscribe_count(), 1);
        assert_eq!(broker.close_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_teardowns_close_once() {
        let broker = MemoryBroker::new();
        let (handle, _rx) = spawn_recorder(&broker, "updates.topic");
        streaming(&handle).await;

        tokio::join!(handle.teardown(), handle.teardown(), handle.teardown());
        assert_eq!(handle.state(), ControllerState::Closed);
        assert_eq!(broker.unsubscribe_count(), 1);
        assert_eq!(broker.close_count(), 1);
    }

    #[tokio::test]
    async fn nothing_delivered_after_teardown() {
        let broker = MemoryBroker::new();
        let (handle, mut rx) = spawn_recorder(&broker, "updates.topic");
        streaming(&handle).await;

        // queued in the transport but not yet read
        for id in 0..5 {
            let _ = broker.publish(&topic("updates.topic"), frame(id));
        }
        handle.teardown().await;
        let _ = broker.publish(&topic("updates.topic"), frame(99));

        assert_eq!(handle.stats().delivered(), 0);
        assert_matches!(rx.try_recv(), Err(_));
    }

    #[tokio::test]
    async fn connect_failure_surfaces_exactly_one_error() {
        let broker = MemoryBroker::new();
        broker.refuse_connections("connection refused");
        let (handle, mut rx) = spawn_recorder(&broker, "feedback.create");

        assert_eq!(
            handle.wait_for(|s| s == ControllerState::Errored).await,
            ControllerState::Errored
        );
        assert_matches!(
            rx.recv().await,
            Some(Event::Error(LiveError::Connect { .. }))
        );
        handle.teardown().await;
        assert_eq!(handle.state(), ControllerState::Closed);
        assert_matches!(rx.try_recv(), Err(_));
        assert_eq!(handle.stats().delivered(), 0);
    }

    #[tokio::test]
    async fn subscribe_failure_is_terminal() {
        let broker = MemoryBroker::new();
        broker.reject_topic("secret.create", "Permissions Violation");
        let (handle, mut rx) = spawn_recorder(&broker, "secret.create");

        assert_matches!(
            rx.recv().await,
            Some(Event::Error(LiveError::Subscribe { .. }))
        );
        assert_eq!(handle.state(), ControllerState::Errored);
        handle.teardown().await;
        assert_eq!(broker.unsubscribe_count(), 0);
        assert_eq!(broker.close_count(), 1);
    }

    #[tokio::test]
    async fn stream_end_without_reconnect_errors() {
        let broker = MemoryBroker::new();
        let (handle, mut rx) = spawn_recorder(&broker, "updates.topic");
        streaming(&handle).await;

        broker.drop_connections();
        assert_matches!(
            rx.recv().await,
            Some(Event::Error(LiveError::StreamEnded { .. }))
        );
        assert_eq!(handle.state(), ControllerState::Errored);
        handle.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stream_end_with_reconnect_resubscribes() {
        let broker = MemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_, lease) = lease(&broker);
        let handle = SubscriptionController::new(
            topic("updates.topic"),
            lease,
            EnvelopeDecoder::<serde_json::Value>::new(),
            Arc::new(Recorder { tx }),
        )
        .with_reconnect(ReconnectPolicy::with_max_retries(3))
        .spawn();
        streaming(&handle).await;

        broker.drop_connections();
        while broker.subscribe_count() < 2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        streaming(&handle).await;

        let _ = broker.publish(&topic("updates.topic"), frame(7));
        assert_eq!(rx.recv().await, Some(Event::Value("7".into())));
        assert_eq!(broker.connect_count(), 2);
        assert_eq!(handle.stats().reconnects(), 1);
        handle.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_are_bounded() {
        let broker = MemoryBroker::new();
        broker.refuse_connections("down");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_, lease) = lease(&broker);
        let handle = SubscriptionController::new(
            topic("updates.topic"),
            lease,
            EnvelopeDecoder::<serde_json::Value>::new(),
            Arc::new(Recorder { tx }),
        )
        .with_reconnect(ReconnectPolicy::with_max_retries(2))
        .spawn();

        assert_matches!(
            rx.recv().await,
            Some(Event::Error(LiveError::Connect { .. }))
        );
        assert_eq!(handle.stats().reconnects(), 2);
        handle.teardown().await;
    }

    #[tokio::test]
    async fn teardown_while_connecting() {
        let broker = MemoryBroker::new();
        broker.pause_connections();
        let (handle, mut rx) = spawn_recorder(&broker, "updates.topic");
        let _ = handle.wait_for(|s| s == ControllerState::Connecting).await;

        handle.teardown().await;
        assert_eq!(handle.state(), ControllerState::Closed);
        broker.resume_connections();
        tokio::task::yield_now().await;
        assert_eq!(broker.open_sessions(), 0);
        assert_matches!(rx.try_recv(), Err(_));
    }

    #[tokio::test]
    async fn teardown_while_subscribing() {
        let broker = MemoryBroker::new();
        broker.pause_subscribes();
        let (handle, _rx) = spawn_recorder(&broker, "updates.topic");
        let _ = handle.wait_for(|s| s == ControllerState::Subscribing).await;

        handle.teardown().await;
        assert_eq!(handle.state(), ControllerState::Closed);
        assert_eq!(broker.close_count(), 1);
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn teardown_failures_still_close() {
        let broker = MemoryBroker::new();
        broker.fail_unsubscribe("gone");
        broker.fail_close("reset");
        let (logs, _guard) = beacon_core::logging::capture_logs();
        let (handle, _rx) = spawn_recorder(&broker, "updates.topic");
        streaming(&handle).await;

        handle.teardown().await;
        assert_eq!(handle.state(), ControllerState::Closed);
        assert!(logs.has_message("unsubscribe failed during teardown"));
        assert!(logs.has_message("close failed during teardown"));
    }

    #[tokio::test]
    async fn dropping_handle_tears_down() {
        let broker = MemoryBroker::new();
        let (handle, _rx) = spawn_recorder(&broker, "updates.topic");
        streaming(&handle).await;
        let mut state = handle.watch_state();

        drop(handle);
        let _ = state.wait_for(|s| *s == ControllerState::Closed).await;
        assert_eq!(broker.close_count(), 1);
    }

    #[tokio::test]
    async fn pull_strategy_sees_values_and_error() {
        let broker = MemoryBroker::new();
        let pull: Arc<PullDelivery<Envelope>> = Arc::new(PullDelivery::new());
        let (_, lease) = lease(&broker);
        let handle = SubscriptionController::new(
            topic("updates.topic"),
            lease,
            EnvelopeDecoder::<serde_json::Value>::new(),
            Arc::clone(&pull) as Arc<dyn DeliveryStrategy<Envelope>>,
        )
        .spawn();
        streaming(&handle).await;

        let mut changes = pull.subscribe();
        let _ = broker.publish(&topic("updates.topic"), frame(1));
        changes.changed().await.unwrap();
        broker.drop_connections();
        let _ = handle.wait_for(|s| s == ControllerState::Errored).await;

        let snap = pull.snapshot();
        assert_eq!(snap.messages.len(), 1);
        assert_eq!(snap.messages[0].value.id, "1");
        assert_matches!(snap.error, Some(LiveError::StreamEnded { .. }));
        handle.teardown().await;
    }

    proptest! {
        #[test]
        fn well_formed_frames_arrive_in_order(
            pattern in proptest::collection::vec(any::<bool>(), 0..40)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let broker = MemoryBroker::new();
                let (handle, mut rx) = spawn_recorder(&broker, "updates.topic");
                streaming(&handle).await;

                let subject = topic("updates.topic");
                let mut expected = Vec::new();
                for (i, well_formed) in pattern.iter().enumerate() {
                    if *well_formed {
                        let _ = broker.publish(&subject, frame(i as u32));
                        expected.push(Event::Value(i.to_string()));
                    } else {
                        let _ = broker.publish(&subject, "{not json");
                        expected.push(Event::DecodeFailed(i as u64));
                    }
                }
                let mut seen = Vec::new();
                for _ in 0..expected.len() {
                    seen.push(rx.recv().await.unwrap());
                }
                assert_eq!(seen, expected);
                assert_eq!(handle.state(), ControllerState::Streaming);
                handle.teardown().await;
            });
        }
    }
}
