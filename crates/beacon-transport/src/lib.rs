//! # beacon-transport
//!
//! Publish/subscribe transports for beacon live subscriptions.
//!
//! - [`Transport`] / [`TransportSession`]: the seam the connection
//!   supervisor is written against
//! - [`MemoryBroker`]: in-process broker for `memory://` endpoints, with
//!   fault injection
//! - [`NatsTransport`]: the NATS client protocol over WebSocket for
//!   `ws://` and `wss://` endpoints

#![deny(unsafe_code)]

pub mod memory;
pub mod nats;
pub mod transport;

pub use memory::{MemoryBroker, MemoryTransport};
pub use nats::{NatsOptions, NatsTransport};
pub use transport::{
    Frame, FrameStream, SubscriptionHandle, SubscriptionId, Transport, TransportError,
    TransportSession,
};
