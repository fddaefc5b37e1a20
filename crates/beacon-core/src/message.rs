//! Decoded messages as handed to delivery strategies.

use std::borrow::Cow;

use bytes::Bytes;

use crate::topic::Topic;

/// A decoded frame.
///
/// `sequence` is the arrival position on the subscription that produced
/// the message (starting at 0 and counting undecodable frames too), not a
/// transport-wide ordering.
#[derive(Clone, Debug, PartialEq)]
pub struct Message<T> {
    /// Concrete subject the frame arrived on.
    pub topic: Topic,
    /// Arrival position on the subscription.
    pub sequence: u64,
    /// Undecoded payload.
    pub raw: Bytes,
    /// Decoded value.
    pub value: T,
}

impl<T> Message<T> {
    /// Transform the decoded value, keeping routing metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Message<U> {
        Message {
            topic: self.topic,
            sequence: self.sequence,
            raw: self.raw,
            value: f(self.value),
        }
    }

    /// The raw payload as text (lossy for non-UTF-8 payloads).
    pub fn raw_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }
}
