//! Lifecycle ownership of live subscriptions.
//!
//! A [`LiveBinding`] ties one subscription controller to the activation
//! span of whatever owns it (a view, a CLI command, a test). Activating
//! starts a controller for a topic; activating with a different topic tears
//! the old controller down completely (unsubscribe, then close) before the
//! new one subscribes; deactivating tears down exactly once.
//!
//! Handler changes on a push binding are applied in place and never
//! resubscribe: a binding's identity is its topic.

use std::sync::Arc;

use beacon_core::{Endpoint, Message, MessageDecoder, ReconnectPolicy, Topic};
use beacon_settings::BroadcastSettings;
use beacon_transport::{NatsOptions, Transport};
use tracing::debug;

use crate::controller::{ControllerHandle, ControllerState, ControllerStats, SubscriptionController};
use crate::delivery::{DeliveryStrategy, PullDelivery, PushDelivery};
use crate::error::LiveError;
use crate::pool::{ConnectionPool, SupervisorLease};
use crate::supervisor::ConnectionSupervisor;

// ─────────────────────────────────────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────────────────────────────────────

/// Where bindings connect and how.
#[derive(Clone)]
pub struct LiveContext {
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    pool: Option<ConnectionPool>,
    reconnect: ReconnectPolicy,
}

impl LiveContext {
    /// Bindings get a dedicated connection to `endpoint` each.
    pub fn new(endpoint: Endpoint, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoint,
            transport,
            pool: None,
            reconnect: ReconnectPolicy::disabled(),
        }
    }

    /// Share connections through `pool`.
    #[must_use]
    pub fn with_pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Reconnect per `policy`.
    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Build a context from broadcast settings.
    pub fn from_settings(
        settings: &BroadcastSettings,
        transport: Arc<dyn Transport>,
    ) -> beacon_settings::Result<Self> {
        let mut ctx = Self::new(settings.endpoint()?, transport)
            .with_reconnect(settings.reconnect.clone());
        if settings.share_connections {
            ctx = ctx.with_pool(ConnectionPool::new());
        }
        Ok(ctx)
    }

    /// The endpoint bindings connect to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The shared pool, if connections are shared.
    pub fn pool(&self) -> Option<&ConnectionPool> {
        self.pool.as_ref()
    }

    /// Reconnect policy handed to every controller.
    pub fn reconnect(&self) -> &ReconnectPolicy {
        &self.reconnect
    }

    /// A supervisor lease for one controller.
    pub fn lease(&self) -> SupervisorLease {
        match &self.pool {
            Some(pool) => pool.acquire(&self.endpoint, &self.transport),
            None => SupervisorLease::dedicated(ConnectionSupervisor::new(
                self.endpoint.clone(),
                Arc::clone(&self.transport),
            )),
        }
    }
}

/// NATS transport options from broadcast settings.
pub fn nats_options(settings: &BroadcastSettings) -> NatsOptions {
    NatsOptions {
        name: settings.client_name.clone(),
        user: settings.user.clone(),
        pass: settings.password.clone(),
        connect_timeout: settings.connect_timeout(),
        ack_timeout: settings.ack_timeout(),
        ping_interval: settings.ping_interval(),
        max_pings_outstanding: settings.max_pings_outstanding,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Binding
// ─────────────────────────────────────────────────────────────────────────────

/// One (topic, strategy) binding with an activation span.
///
/// Dropping an active binding requests teardown without waiting for it.
pub struct LiveBinding<D, S>
where
    D: MessageDecoder + Clone,
    S: DeliveryStrategy<D::Output>,
{
    ctx: LiveContext,
    decoder: D,
    strategy: Arc<S>,
    active: Option<ControllerHandle>,
    activated_before: bool,
}

impl<D, S> LiveBinding<D, S>
where
    D: MessageDecoder + Clone,
    S: DeliveryStrategy<D::Output>,
{
    /// An inactive binding delivering through `strategy`.
    pub fn new(ctx: LiveContext, decoder: D, strategy: Arc<S>) -> Self {
        Self {
            ctx,
            decoder,
            strategy,
            active: None,
            activated_before: false,
        }
    }

    /// Start streaming `topic`.
    ///
    /// A no-op when already bound to `topic`. Otherwise any current
    /// controller is fully torn down first, then the strategy is told it is
    /// being reactivated, then a new controller is spawned.
    pub async fn activate(&mut self, topic: Topic) {
        if self.topic() == Some(&topic) {
            return;
        }
        self.deactivate().await;
        if self.activated_before {
            self.strategy.reactivated();
        }
        self.activated_before = true;

        debug!(%topic, endpoint = %self.ctx.endpoint, "activating live binding");
        let controller = SubscriptionController::new(
            topic,
            self.ctx.lease(),
            self.decoder.clone(),
            Arc::clone(&self.strategy) as Arc<dyn DeliveryStrategy<D::Output>>,
        )
        .with_reconnect(self.ctx.reconnect.clone());
        self.active = Some(controller.spawn());
    }

    /// Tear down and start a fresh controller on the current topic.
    /// A no-op when inactive.
    pub async fn reactivate(&mut self) {
        let Some(topic) = self.topic().cloned() else {
            return;
        };
        self.deactivate().await;
        self.activate(topic).await;
    }

    /// Tear down the current controller, waiting until it is closed.
    /// Idempotent.
    pub async fn deactivate(&mut self) {
        if let Some(handle) = self.active.take() {
            debug!(topic = %handle.topic(), "deactivating live binding");
            handle.teardown().await;
        }
    }

    /// Whether a controller is running.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// The bound topic while active.
    pub fn topic(&self) -> Option<&Topic> {
        self.active.as_ref().map(ControllerHandle::topic)
    }

    /// The current controller's state while active.
    pub fn state(&self) -> Option<ControllerState> {
        self.active.as_ref().map(ControllerHandle::state)
    }

    /// The current controller's counters while active.
    pub fn stats(&self) -> Option<Arc<ControllerStats>> {
        self.active.as_ref().map(|h| Arc::clone(h.stats()))
    }

    /// The current controller while active.
    pub fn handle(&self) -> Option<&ControllerHandle> {
        self.active.as_ref()
    }

    /// The delivery strategy.
    pub fn strategy(&self) -> &Arc<S> {
        &self.strategy
    }

    /// The context bindings connect through.
    pub fn context(&self) -> &LiveContext {
        &self.ctx
    }
}

impl<D> LiveBinding<D, PushDelivery<D::Output>>
where
    D: MessageDecoder + Clone,
{
    /// An inactive push binding calling `handler` per message.
    pub fn push(
        ctx: LiveContext,
        decoder: D,
        handler: impl Fn(Message<D::Output>) + Send + Sync + 'static,
    ) -> Self {
        Self::new(ctx, decoder, Arc::new(PushDelivery::new(handler)))
    }

    /// Replace the message handler without resubscribing.
    pub fn set_handler(&self, handler: impl Fn(Message<D::Output>) + Send + Sync + 'static) {
        self.strategy.set_handler(handler);
    }

    /// Replace the error handler without resubscribing.
    pub fn set_error_handler(&self, handler: impl Fn(LiveError) + Send + Sync + 'static) {
        self.strategy.set_error_handler(handler);
    }

    /// Apply a new (topic, handler) pair. The handler is swapped first, so
    /// a same-topic update only rebinds the handler.
    pub async fn update(
        &mut self,
        topic: Topic,
        handler: impl Fn(Message<D::Output>) + Send + Sync + 'static,
    ) {
        self.set_handler(handler);
        self.activate(topic).await;
    }
}

impl<D> LiveBinding<D, PullDelivery<D::Output>>
where
    D: MessageDecoder + Clone,
{
    /// An inactive pull binding buffering up to `capacity` messages
    /// (unbounded when `None`).
    pub fn pull(ctx: LiveContext, decoder: D, capacity: Option<usize>) -> Self {
        Self::new(ctx, decoder, Arc::new(PullDelivery::with_capacity(capacity)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
