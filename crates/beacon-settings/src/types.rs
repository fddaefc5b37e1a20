//! Settings types.
//!
//! Every field carries a serde default so a partial settings file fills in
//! the rest. JSON keys are camelCase.

use std::time::Duration;

use beacon_core::{Endpoint, ReconnectPolicy};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BeaconSettings {
    /// Broadcast connection settings.
    pub broadcast: BroadcastSettings,
    /// Diagnostic output settings.
    pub logging: LoggingSettings,
}

impl BeaconSettings {
    /// Check values serde cannot check on its own.
    pub fn validate(&self) -> Result<()> {
        let _ = self.broadcast.endpoint()?;
        if self.broadcast.pull_buffer_capacity == Some(0) {
            return Err(SettingsError::InvalidValue(
                "broadcast.pullBufferCapacity must be at least 1".into(),
            ));
        }
        if self.broadcast.max_pings_outstanding == 0 {
            return Err(SettingsError::InvalidValue(
                "broadcast.maxPingsOutstanding must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Where and how to connect to the broadcast transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BroadcastSettings {
    /// Transport URL (`ws://`, `wss://` or `memory://`).
    pub endpoint: String,
    /// Username sent in the connect handshake.
    pub user: Option<String>,
    /// Password sent in the connect handshake.
    pub password: Option<String>,
    /// Client name reported to the server.
    pub client_name: String,
    /// Handshake deadline.
    pub connect_timeout_ms: u64,
    /// Deadline for subscribe/unsubscribe acknowledgements.
    pub ack_timeout_ms: u64,
    /// Interval between keepalive pings.
    pub ping_interval_ms: u64,
    /// Unanswered pings before the connection is declared stale.
    pub max_pings_outstanding: u32,
    /// Share one connection per endpoint across live bindings.
    pub share_connections: bool,
    /// Bound on buffered pull messages; `None` keeps everything.
    pub pull_buffer_capacity: Option<usize>,
    /// Reconnect after the stream ends unexpectedly.
    pub reconnect: ReconnectPolicy,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8080".into(),
            user: None,
            password: None,
            client_name: "beacon".into(),
            connect_timeout_ms: 10_000,
            ack_timeout_ms: 5_000,
            ping_interval_ms: 30_000,
            max_pings_outstanding: 2,
            share_connections: false,
            pull_buffer_capacity: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl BroadcastSettings {
    /// The parsed endpoint.
    pub fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.endpoint).map_err(|e| SettingsError::InvalidValue(e.to_string()))
    }

    /// Handshake deadline as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Acknowledgement deadline as a [`Duration`].
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Keepalive interval as a [`Duration`].
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// Diagnostic output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level or `EnvFilter` directive.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}
