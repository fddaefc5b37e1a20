//! # beacon-live
//!
//! Live broadcast subscriptions with explicit lifecycles.
//!
//! - [`ConnectionSupervisor`]: owns one transport connection per endpoint;
//!   connect is idempotent and shares an in-flight attempt, close is the
//!   only mutator
//! - [`ConnectionPool`]: optional sharing of supervisors by endpoint through
//!   reference-counted [`SupervisorLease`]s
//! - [`SubscriptionController`]: one topic, one task; decodes frames in
//!   arrival order and hands them to a [`DeliveryStrategy`]
//! - [`PushDelivery`] / [`PullDelivery`]: handler callbacks or an observable
//!   buffer with a latest-error slot
//! - [`LiveBinding`]: activation span of a controller; topic changes tear
//!   down before resubscribing
//!
//! ```text
//! LiveBinding ──activate──▶ SubscriptionController ──lease──▶ ConnectionSupervisor
//!                                  │                                │
//!                           MessageDecoder                  TransportSession
//!                                  │
//!                           DeliveryStrategy ──▶ consumer
//! ```

#![deny(unsafe_code)]

pub mod controller;
pub mod delivery;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod supervisor;

pub use controller::{ControllerHandle, ControllerState, ControllerStats, SubscriptionController};
pub use delivery::{DeliveryStrategy, ErrorHandler, Handler, PullDelivery, PullSnapshot, PushDelivery};
pub use error::{ConnectError, LiveError};
pub use lifecycle::{LiveBinding, LiveContext, nats_options};
pub use pool::{ConnectionPool, SupervisorLease};
pub use supervisor::{Connection, ConnectionState, ConnectionSupervisor};
