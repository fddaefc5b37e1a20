//! # beacon-core
//!
//! Shared vocabulary for beacon live subscriptions.
//!
//! - **Topics**: [`Topic`] with NATS-style wildcards, [`EntityTopics`] for the
//!   backend's per-entity broadcast subjects, [`ChangeKind`]
//! - **Endpoints**: [`Endpoint`], the validated transport URL
//! - **Decoding**: [`Envelope`], [`MessageDecoder`], [`EnvelopeDecoder`], [`DecodeFailure`]
//! - **Messages**: [`Message`], one decoded frame with its arrival position
//! - **Entities**: [`Feedback`] as broadcast by the feedback service
//! - **Reconnect**: [`ReconnectPolicy`] backoff math
//! - **Logging**: subscriber setup and log capture for tests

#![deny(unsafe_code)]

pub mod decoder;
pub mod endpoint;
pub mod envelope;
pub mod feedback;
pub mod ids;
pub mod logging;
pub mod message;
pub mod retry;
pub mod topic;

pub use decoder::{DecodeFailure, DecodeFailureKind, EnvelopeDecoder, MessageDecoder};
pub use endpoint::{Endpoint, EndpointError, Scheme};
pub use envelope::Envelope;
pub use feedback::{Feedback, FeedbackType};
pub use ids::ConnectionId;
pub use message::Message;
pub use retry::ReconnectPolicy;
pub use topic::{ChangeKind, EntityTopics, Topic, TopicError};
