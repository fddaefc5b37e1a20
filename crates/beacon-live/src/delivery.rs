//! Delivery strategies.
//!
//! A [`DeliveryStrategy`] receives every decoded message of one subscription
//! in arrival order, plus terminal errors. Two policies ship:
//!
//! - [`PushDelivery`]: calls the currently bound handler for each message
//! - [`PullDelivery`]: appends to an ordered buffer with a single
//!   latest-error slot, observable by readers

use std::collections::VecDeque;
use std::sync::Arc;

use beacon_core::{DecodeFailure, Message, Topic};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::warn;

use crate::error::LiveError;

/// Receives the output of one subscription.
///
/// Calls are made sequentially from the subscription's task; implementations
/// must not block.
pub trait DeliveryStrategy<T>: Send + Sync + 'static {
    /// One decoded message.
    fn deliver(&self, message: Message<T>);

    /// A terminal error. The subscription delivers nothing further.
    fn deliver_error(&self, error: LiveError);

    /// A frame that failed to decode and was skipped.
    fn decode_failed(&self, _topic: &Topic, _sequence: u64, _failure: &DecodeFailure) {}

    /// The owning binding is about to start a new subscription.
    fn reactivated(&self) {}
}

// ─────────────────────────────────────────────────────────────────────────────
// Push
// ─────────────────────────────────────────────────────────────────────────────

/// Message handler for [`PushDelivery`].
pub type Handler<T> = Arc<dyn Fn(Message<T>) + Send + Sync>;

/// Error handler for [`PushDelivery`].
pub type ErrorHandler = Arc<dyn Fn(LiveError) + Send + Sync>;

/// Invokes a consumer-supplied handler per message.
///
/// Handlers can be swapped at any time; the next message goes to the
/// handler bound at that moment.
pub struct PushDelivery<T> {
    handler: RwLock<Handler<T>>,
    error_handler: RwLock<Option<ErrorHandler>>,
}

impl<T> PushDelivery<T> {
    /// Create a strategy delivering to `handler`.
    pub fn new(handler: impl Fn(Message<T>) + Send + Sync + 'static) -> Self {
        Self {
            handler: RwLock::new(Arc::new(handler)),
            error_handler: RwLock::new(None),
        }
    }

    /// Bind an error handler at construction.
    #[must_use]
    pub fn with_error_handler(self, handler: impl Fn(LiveError) + Send + Sync + 'static) -> Self {
        self.set_error_handler(handler);
        self
    }

    /// Replace the message handler.
    pub fn set_handler(&self, handler: impl Fn(Message<T>) + Send + Sync + 'static) {
        *self.handler.write() = Arc::new(handler);
    }

    /// Replace the error handler.
    pub fn set_error_handler(&self, handler: impl Fn(LiveError) + Send + Sync + 'static) {
        *self.error_handler.write() = Some(Arc::new(handler));
    }
}

impl<T: Send + 'static> DeliveryStrategy<T> for PushDelivery<T> {
    fn deliver(&self, message: Message<T>) {
        // call outside the lock so a handler may rebind itself
        let handler = Arc::clone(&*self.handler.read());
        handler(message);
    }

    fn deliver_error(&self, error: LiveError) {
        let handler = self.error_handler.read().clone();
        match handler {
            Some(handler) => handler(error),
            None => warn!(kind = error.kind(), %error, "live subscription failed with no error handler bound"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pull
// ─────────────────────────────────────────────────────────────────────────────

/// Point-in-time view of a [`PullDelivery`].
#[derive(Clone, Debug)]
pub struct PullSnapshot<T> {
    /// Buffered messages, oldest first.
    pub messages: Vec<Message<T>>,
    /// The most recent terminal error.
    pub error: Option<LiveError>,
    /// Change counter at the time of the snapshot.
    pub version: u64,
}

struct PullState<T> {
    messages: VecDeque<Message<T>>,
    error: Option<LiveError>,
    evicted: u64,
}

/// Appends messages to an ordered buffer and keeps the latest error.
///
/// Unbounded unless built with [`bounded`](Self::bounded), which evicts the
/// oldest message when full. The error slot holds one error; a new error
/// replaces it and only [`reset`](Self::reset) clears it.
pub struct PullDelivery<T> {
    state: Mutex<PullState<T>>,
    capacity: Option<usize>,
    version: watch::Sender<u64>,
}

impl<T> Default for PullDelivery<T> {
    fn default() -> Self {
        Self::with_capacity(None)
    }
}

impl<T> PullDelivery<T> {
    /// Unbounded buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer keeping at most `capacity` messages (minimum 1).
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    /// Bounded when `capacity` is set, unbounded otherwise.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(PullState {
                messages: VecDeque::new(),
                error: None,
                evicted: 0,
            }),
            capacity,
            version: watch::channel(0).0,
        }
    }

    /// Configured bound.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().messages.is_empty()
    }

    /// Messages dropped to honor the bound since the last reset.
    pub fn evicted(&self) -> u64 {
        self.state.lock().evicted
    }

    /// The latest terminal error, if any.
    pub fn latest_error(&self) -> Option<LiveError> {
        self.state.lock().error.clone()
    }

    /// Remove and return every buffered message, oldest first.
    pub fn drain(&self) -> Vec<Message<T>> {
        let drained: Vec<_> = self.state.lock().messages.drain(..).collect();
        if !drained.is_empty() {
            self.bump();
        }
        drained
    }

    /// Receiver whose value changes whenever the buffer or error slot does.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Current change counter.
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Clear messages and the error slot.
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            state.messages.clear();
            state.error = None;
            state.evicted = 0;
        }
        self.bump();
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

impl<T: Clone> PullDelivery<T> {
    /// Copy of the buffered messages, oldest first.
    pub fn messages(&self) -> Vec<Message<T>> {
        self.state.lock().messages.iter().cloned().collect()
    }

    /// Messages, error and version read atomically.
    pub fn snapshot(&self) -> PullSnapshot<T> {
        let state = self.state.lock();
        PullSnapshot {
            messages: state.messages.iter().cloned().collect(),
            error: state.error.clone(),
            version: *self.version.borrow(),
        }
    }
}

impl<T: Send + 'static> DeliveryStrategy<T> for PullDelivery<T> {
    fn deliver(&self, message: Message<T>) {
        {
            let mut state = self.state.lock();
            if let Some(capacity) = self.capacity {
                while state.messages.len() >= capacity {
                    let _ = state.messages.pop_front();
                    state.evicted += 1;
                }
            }
            state.messages.push_back(message);
        }
        self.bump();
    }

    fn deliver_error(&self, error: LiveError) {
        self.state.lock().error = Some(error);
        self.bump();
    }

    fn reactivated(&self) {
        self.reset();
    }
}
