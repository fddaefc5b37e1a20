//! Connection supervision.
//!
//! A [`ConnectionSupervisor`] owns one logical connection to one endpoint.
//! It connects lazily, lets concurrent callers share a single in-flight
//! handshake, publishes its [`ConnectionState`], and is the only thing that
//! closes the connection. Each established session gets a generation number
//! so a caller that saw a session die can invalidate exactly that session
//! and not a newer one.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use beacon_core::{ConnectionId, Endpoint, Topic};
use beacon_transport::{
    SubscriptionHandle, SubscriptionId, Transport, TransportError, TransportSession,
};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ConnectError;

/// Observable connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session and no attempt in progress.
    Disconnected,
    /// A handshake is in flight.
    Connecting,
    /// A session is established.
    Ready,
    /// The last attempt failed. A later `connect` starts a fresh attempt.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

/// A non-owning handle to an established session.
///
/// Holders can subscribe and unsubscribe; only the supervisor can close.
#[derive(Clone)]
pub struct Connection {
    generation: u64,
    endpoint: Endpoint,
    session: Arc<dyn TransportSession>,
}

impl Connection {
    /// Which session of the supervisor this is.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The endpoint the session is connected to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Transport-level identifier.
    pub fn id(&self) -> &ConnectionId {
        self.session.id()
    }

    /// Whether the session is still usable.
    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    /// Subscribe to `topic` on this session.
    pub async fn subscribe(&self, topic: &Topic) -> Result<SubscriptionHandle, TransportError> {
        self.session.subscribe(topic).await
    }

    /// Remove a subscription from this session.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        self.session.unsubscribe(id).await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("generation", &self.generation)
            .field("endpoint", &self.endpoint.as_str())
            .field("id", &self.id().as_str())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────────────────────────

type PendingConnect = Shared<BoxFuture<'static, Result<Connection, ConnectError>>>;

enum Slot {
    Idle,
    Connecting { generation: u64, attempt: PendingConnect },
    Ready(Connection),
    Closed,
}

struct SupervisorInner {
    endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    slot: Mutex<Slot>,
    state: watch::Sender<ConnectionState>,
    next_generation: AtomicU64,
}

impl SupervisorInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(endpoint = %self.endpoint, from = %previous, to = %state, "connection state");
        }
    }
}

/// Owns the lifecycle of one logical connection. Cheap to clone; clones
/// share the connection.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
    /// Create a supervisor for `endpoint`. Nothing connects until
    /// [`connect`](Self::connect) is called.
    pub fn new(endpoint: Endpoint, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                endpoint,
                transport,
                slot: Mutex::new(Slot::Idle),
                state: watch::channel(ConnectionState::Disconnected).0,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// The supervised endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.slot.lock(), Slot::Closed)
    }

    /// Return the established connection, establishing it if needed.
    ///
    /// Calls made while a handshake is in flight wait on that same
    /// handshake. A failed attempt is reported to every waiter and leaves
    /// the state `Failed`; it is not retried here.
    pub async fn connect(&self) -> Result<Connection, ConnectError> {
        let attempt = {
            let mut slot = self.inner.slot.lock();
            match &*slot {
                Slot::Closed => return Err(ConnectError::Closed),
                Slot::Ready(conn) if conn.is_open() => return Ok(conn.clone()),
                Slot::Connecting { attempt, .. } => attempt.clone(),
                Slot::Ready(_) | Slot::Idle => {
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
                    let attempt = establish(Arc::clone(&self.inner), generation)
                        .boxed()
                        .shared();
                    *slot = Slot::Connecting {
                        generation,
                        attempt: attempt.clone(),
                    };
                    self.inner.set_state(ConnectionState::Connecting);
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Drop session `generation` if it is still the current one, so the
    /// next [`connect`](Self::connect) establishes a fresh session.
    pub async fn invalidate(&self, generation: u64) {
        let stale = {
            let mut slot = self.inner.slot.lock();
            if matches!(&*slot, Slot::Ready(conn) if conn.generation == generation) {
                match std::mem::replace(&mut *slot, Slot::Idle) {
                    Slot::Ready(conn) => Some(conn),
                    _ => None,
                }
            } else {
                None
            }
        };
        if let Some(conn) = stale {
            self.inner.set_state(ConnectionState::Disconnected);
            info!(endpoint = %self.inner.endpoint, generation, "connection invalidated");
            if let Err(error) = conn.session.close().await {
                debug!(endpoint = %self.inner.endpoint, %error, "closing invalidated session failed");
            }
        }
    }

    /// Close the connection. Idempotent; safe before any connect.
    ///
    /// After `close`, [`connect`](Self::connect) fails with
    /// [`ConnectError::Closed`]. A handshake still in flight is discarded
    /// when it completes.
    pub async fn close(&self) -> Result<(), TransportError> {
        let previous = std::mem::replace(&mut *self.inner.slot.lock(), Slot::Closed);
        match previous {
            Slot::Closed => Ok(()),
            Slot::Idle => {
                self.inner.set_state(ConnectionState::Disconnected);
                Ok(())
            }
            Slot::Connecting { generation, .. } => {
                self.inner.set_state(ConnectionState::Disconnected);
                debug!(endpoint = %self.inner.endpoint, generation, "closed while connecting");
                Ok(())
            }
            Slot::Ready(conn) => {
                self.inner.set_state(ConnectionState::Disconnected);
                let result = conn.session.close().await;
                info!(
                    endpoint = %self.inner.endpoint,
                    connection = %conn.id(),
                    generation = conn.generation,
                    "connection closed"
                );
                result
            }
        }
    }
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("state", &self.state())
            .finish()
    }
}

enum Established {
    Current(Connection),
    Superseded(Arc<dyn TransportSession>),
    Failed(TransportError),
}

async fn establish(inner: Arc<SupervisorInner>, generation: u64) -> Result<Connection, ConnectError> {
    debug!(endpoint = %inner.endpoint, generation, "connecting");
    let result = inner.transport.connect(&inner.endpoint).await;

    let outcome = {
        let mut slot = inner.slot.lock();
        let current = matches!(&*slot, Slot::Connecting { generation: g, .. } if *g == generation);
        match result {
            Ok(session) if current => {
                let conn = Connection {
                    generation,
                    endpoint: inner.endpoint.clone(),
                    session,
                };
                *slot = Slot::Ready(conn.clone());
                Established::Current(conn)
            }
            Ok(session) => Established::Superseded(session),
            Err(error) => {
                if current {
                    *slot = Slot::Idle;
                }
                Established::Failed(error)
            }
        }
    };

    match outcome {
        Established::Current(conn) => {
            inner.set_state(ConnectionState::Ready);
            info!(
                endpoint = %inner.endpoint,
                connection = %conn.id(),
                generation,
                "connection ready"
            );
            Ok(conn)
        }
        Established::Superseded(session) => {
            debug!(endpoint = %inner.endpoint, generation, "discarding superseded session");
            let _ = session.close().await;
            Err(ConnectError::Closed)
        }
        Established::Failed(error) => {
            if !matches!(*inner.slot.lock(), Slot::Closed) {
                inner.set_state(ConnectionState::Failed);
            }
            warn!(endpoint = %inner.endpoint, generation, %error, "connect failed");
            Err(ConnectError::Transport(error))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
