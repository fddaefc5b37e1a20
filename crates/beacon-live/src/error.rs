//! Errors surfaced by live subscriptions.

use beacon_core::Topic;
use beacon_transport::TransportError;
use thiserror::Error;

/// Why [`ConnectionSupervisor::connect`](crate::ConnectionSupervisor::connect) failed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The supervisor was closed; it never connects again.
    #[error("connection supervisor is closed")]
    Closed,
    /// The transport could not establish the connection.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Terminal errors handed to a delivery strategy's error channel.
///
/// Decode failures are not terminal and never appear here.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LiveError {
    /// The connection could not be established.
    #[error("connect to {endpoint} failed: {cause}")]
    Connect {
        /// Target endpoint.
        endpoint: String,
        /// Underlying failure.
        #[source]
        cause: ConnectError,
    },
    /// The transport refused the topic.
    #[error("subscribe to {topic} failed: {cause}")]
    Subscribe {
        /// Requested topic.
        topic: Topic,
        /// Underlying failure.
        #[source]
        cause: TransportError,
    },
    /// The transport ended the frame stream and no reconnect was allowed.
    #[error("stream for {topic} ended")]
    StreamEnded {
        /// Subscribed topic.
        topic: Topic,
    },
}

impl LiveError {
    /// Short classification for logs and JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Subscribe { .. } => "subscribe",
            Self::StreamEnded { .. } => "stream_ended",
        }
    }
}
