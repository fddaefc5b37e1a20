//! The broadcast wire envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One broadcast as published by the backend:
/// `{ "id": "...", "timestamp": "<ISO-8601>", "data": <JSON> }`.
///
/// All three fields are required; `data` defaults to an opaque JSON value
/// and can be narrowed to an entity type such as [`Feedback`](crate::Feedback).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = serde_json::Value> {
    /// Broadcast identifier.
    pub id: String,
    /// When the broadcast was produced.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    pub data: T,
}
