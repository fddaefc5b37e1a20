//! The transport seam.
//!
//! A [`Transport`] opens [`TransportSession`]s to an [`Endpoint`]; a session
//! multiplexes any number of topic subscriptions. Frames for one
//! subscription arrive on its [`FrameStream`] in the order the server sent
//! them. The stream ends when the subscription is removed or the session
//! goes away.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use beacon_core::{ConnectionId, Endpoint, Topic};
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;

/// One raw frame received on a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Concrete subject the frame was published on.
    pub subject: Topic,
    /// Undecoded payload.
    pub payload: Bytes,
}

/// Ordered frames for one subscription.
pub type FrameStream = Pin<Box<dyn Stream<Item = Frame> + Send>>;

/// Session-scoped subscription identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A confirmed subscription.
pub struct SubscriptionHandle {
    /// Identifier to pass to [`TransportSession::unsubscribe`].
    pub id: SubscriptionId,
    /// The subscribed topic (may contain wildcards).
    pub topic: Topic,
    /// Incoming frames.
    pub frames: FrameStream,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Transport failures. Reasons are kept as strings so errors can be cloned
/// and fanned out to every waiter of a shared operation.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The endpoint scheme is not handled by this transport.
    #[error("endpoint {0} is not supported by this transport")]
    UnsupportedEndpoint(String),
    /// Could not establish the connection.
    #[error("connect to {endpoint} failed: {reason}")]
    Connect {
        /// Target endpoint.
        endpoint: String,
        /// Underlying cause.
        reason: String,
    },
    /// The server refused the subscription.
    #[error("subscribe to {topic} rejected: {reason}")]
    Subscribe {
        /// Requested topic.
        topic: String,
        /// Server's reason.
        reason: String,
    },
    /// The server did not confirm removal of a subscription.
    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),
    /// Closing the session reported an error.
    #[error("close failed: {0}")]
    Close(String),
    /// An acknowledgement did not arrive in time.
    #[error("timed out waiting for {0}")]
    Timeout(String),
    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The session is no longer open.
    #[error("session closed")]
    Closed,
}

/// Opens sessions to endpoints.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a session. Resolves once the session is usable.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn TransportSession>, TransportError>;
}

/// An established connection.
#[async_trait]
pub trait TransportSession: Send + Sync + 'static {
    /// Identifier for logs.
    fn id(&self) -> &ConnectionId;

    /// Whether the session can still carry subscriptions.
    fn is_open(&self) -> bool;

    /// Subscribe to `topic`. Resolves once the server has accepted it.
    async fn subscribe(&self, topic: &Topic) -> Result<SubscriptionHandle, TransportError>;

    /// Remove a subscription. Unknown ids are a no-op.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;

    /// Close the session, ending every subscription stream.
    async fn close(&self) -> Result<(), TransportError>;
}

impl fmt::Debug for dyn TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("id", self.id())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = TransportError::Subscribe {
            topic: "feedback.create".into(),
            reason: "Permissions Violation".into(),
        };
        assert_eq!(
            err.to_string(),
            "subscribe to feedback.create rejected: Permissions Violation"
        );
        assert_eq!(TransportError::Closed.to_string(), "session closed");
    }

    #[test]
    fn handle_debug_omits_stream() {
        let handle = SubscriptionHandle {
            id: SubscriptionId(7),
            topic: Topic::new("a.b").unwrap(),
            frames: Box::pin(futures::stream::empty()),
        };
        let debug = format!("{handle:?}");
        assert!(debug.contains("SubscriptionId(7)"));
        assert!(!debug.contains("frames"));
    }
}
