//! NATS client protocol carried over WebSocket.
//!
//! [`NatsTransport`] opens one WebSocket per session, performs the
//! `INFO`/`CONNECT`/`PING` handshake in verbose mode, and then hands the
//! socket to a background task that multiplexes subscriptions, answers
//! server pings, sends keepalive pings, and matches `+OK`/`-ERR`
//! acknowledgements to the requests that caused them.

mod connection;
pub mod proto;

pub use connection::{NatsOptions, NatsTransport};
pub use proto::{ClientOp, ConnectInfo, NatsCodec, ProtocolError, ServerInfo, ServerOp};
