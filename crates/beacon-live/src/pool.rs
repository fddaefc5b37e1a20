//! Shared connections keyed by endpoint.
//!
//! A [`ConnectionPool`] hands out [`SupervisorLease`]s. Every lease for the
//! same endpoint shares one [`ConnectionSupervisor`]; releasing the last
//! lease closes the connection and forgets the endpoint. A dedicated lease
//! owns its supervisor outright and closes it on release.

use std::collections::HashMap;
use std::sync::Arc;

use beacon_core::Endpoint;
use beacon_transport::{Transport, TransportError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::supervisor::ConnectionSupervisor;

struct PoolEntry {
    supervisor: ConnectionSupervisor,
    leases: usize,
}

/// Reference-counted supervisors keyed by endpoint. Cheap to clone.
#[derive(Clone, Default)]
pub struct ConnectionPool {
    entries: Arc<Mutex<HashMap<Endpoint, PoolEntry>>>,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease the supervisor for `endpoint`, creating it on first use.
    pub fn acquire(&self, endpoint: &Endpoint, transport: &Arc<dyn Transport>) -> SupervisorLease {
        let mut entries = self.entries.lock();
        let entry = entries.entry(endpoint.clone()).or_insert_with(|| PoolEntry {
            supervisor: ConnectionSupervisor::new(endpoint.clone(), Arc::clone(transport)),
            leases: 0,
        });
        entry.leases += 1;
        debug!(%endpoint, leases = entry.leases, "supervisor leased");
        SupervisorLease {
            supervisor: entry.supervisor.clone(),
            pool: Some(self.clone()),
            released: false,
        }
    }

    /// Outstanding leases for `endpoint`.
    pub fn lease_count(&self, endpoint: &Endpoint) -> usize {
        self.entries.lock().get(endpoint).map_or(0, |e| e.leases)
    }

    /// Endpoints with at least one lease.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no endpoint is leased.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop one lease. Returns the supervisor when it was the last one.
    fn return_lease(&self, endpoint: &Endpoint) -> Option<ConnectionSupervisor> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(endpoint)?;
        entry.leases = entry.leases.saturating_sub(1);
        debug!(%endpoint, leases = entry.leases, "supervisor lease returned");
        if entry.leases > 0 {
            return None;
        }
        entries.remove(endpoint).map(|e| e.supervisor)
    }
}

/// The right to use a [`ConnectionSupervisor`] until released.
pub struct SupervisorLease {
    supervisor: ConnectionSupervisor,
    pool: Option<ConnectionPool>,
    released: bool,
}

impl SupervisorLease {
    /// A lease on a supervisor nobody else shares.
    pub fn dedicated(supervisor: ConnectionSupervisor) -> Self {
        Self {
            supervisor,
            pool: None,
            released: false,
        }
    }

    /// The leased supervisor.
    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    /// Whether the supervisor is shared through a pool.
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Give the lease back, closing the connection if no other lease holds
    /// it. Returns the close error, if any.
    pub async fn release(mut self) -> Result<(), TransportError> {
        self.released = true;
        match self.last_holder() {
            Some(supervisor) => supervisor.close().await,
            None => Ok(()),
        }
    }

    fn last_holder(&self) -> Option<ConnectionSupervisor> {
        match &self.pool {
            Some(pool) => pool.return_lease(self.supervisor.endpoint()),
            None => Some(self.supervisor.clone()),
        }
    }
}

impl Drop for SupervisorLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(supervisor) = self.last_holder() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            drop(runtime.spawn(async move {
                let _ = supervisor.close().await;
            }));
        } else {
            warn!(endpoint = %supervisor.endpoint(), "lease dropped outside a runtime; connection left open");
        }
    }
}
