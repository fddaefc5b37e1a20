//! Frame decoding.
//!
//! A [`MessageDecoder`] turns a raw frame payload into a typed value or a
//! [`DecodeFailure`]. Decoding is pure and synchronous; a failure describes
//! one bad frame and never ends the stream it came from.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::error::Category;
use thiserror::Error;

use crate::envelope::Envelope;

/// Bytes of payload kept in a failure preview.
const PREVIEW_LIMIT: usize = 64;

/// Why a frame could not be decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeFailureKind {
    /// Not valid JSON (syntax error or truncated input).
    Malformed,
    /// Valid JSON, wrong shape (missing or mistyped fields).
    Shape,
}

impl fmt::Display for DecodeFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => f.write_str("malformed"),
            Self::Shape => f.write_str("invalid"),
        }
    }
}

/// One frame that could not be decoded.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind} frame: {reason}")]
pub struct DecodeFailure {
    /// Failure class.
    pub kind: DecodeFailureKind,
    /// Human-readable reason.
    pub reason: String,
    /// Leading bytes of the payload, for diagnostics.
    pub preview: String,
}

impl DecodeFailure {
    /// Build a failure for `payload`.
    pub fn new(kind: DecodeFailureKind, reason: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            kind,
            reason: reason.into(),
            preview: preview(payload),
        }
    }

    /// Classify a `serde_json` error.
    pub fn from_json(error: &serde_json::Error, payload: &[u8]) -> Self {
        let kind = match error.classify() {
            Category::Data => DecodeFailureKind::Shape,
            Category::Syntax | Category::Eof | Category::Io => DecodeFailureKind::Malformed,
        };
        Self::new(kind, error.to_string(), payload)
    }
}

fn preview(payload: &[u8]) -> String {
    if payload.len() <= PREVIEW_LIMIT {
        return String::from_utf8_lossy(payload).into_owned();
    }
    let mut text = String::from_utf8_lossy(&payload[..PREVIEW_LIMIT]).into_owned();
    text.push('…');
    text
}

/// Decodes raw frame payloads.
pub trait MessageDecoder: Send + Sync + 'static {
    /// Decoded value type.
    type Output: Send + 'static;

    /// Decode one payload.
    fn decode(&self, payload: &[u8]) -> Result<Self::Output, DecodeFailure>;
}

/// Decodes the `{id, timestamp, data}` broadcast envelope, with `data`
/// deserialized as `T`.
pub struct EnvelopeDecoder<T = serde_json::Value> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> EnvelopeDecoder<T> {
    /// Create a decoder.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for EnvelopeDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for EnvelopeDecoder<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EnvelopeDecoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeDecoder")
            .field("data", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> MessageDecoder for EnvelopeDecoder<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = Envelope<T>;

    fn decode(&self, payload: &[u8]) -> Result<Envelope<T>, DecodeFailure> {
        let envelope: Envelope<T> =
            serde_json::from_slice(payload).map_err(|e| DecodeFailure::from_json(&e, payload))?;
        if envelope.id.is_empty() {
            return Err(DecodeFailure::new(
                DecodeFailureKind::Shape,
                "envelope id is empty",
                payload,
            ));
        }
        Ok(envelope)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::{Feedback, FeedbackType};
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn decode(payload: &str) -> Result<Envelope, DecodeFailure> {
        EnvelopeDecoder::<serde_json::Value>::new().decode(payload.as_bytes())
    }

    #[test]
    fn decodes_well_formed_envelope() {
        let env = decode(r#"{"id":"1","timestamp":"2024-01-01T00:00:00Z","data":{"action":"created"}}"#)
            .unwrap();
        assert_eq!(env.id, "1");
        assert_eq!(env.data["action"], "created");
    }

    #[test]
    fn truncated_frame_is_malformed() {
        let failure = decode(r#"{"id":"2""#).unwrap_err();
        assert_eq!(failure.kind, DecodeFailureKind::Malformed);
        assert_eq!(failure.preview, r#"{"id":"2""#);
    }

    #[test]
    fn garbage_is_malformed() {
        assert_matches!(
            decode("not json"),
            Err(DecodeFailure { kind: DecodeFailureKind::Malformed, .. })
        );
        assert_matches!(decode(""), Err(DecodeFailure { kind: DecodeFailureKind::Malformed, .. }));
    }

    #[test]
    fn missing_fields_are_shape_failures() {
        assert_matches!(
            decode(r#"{"id":"1","data":{}}"#),
            Err(DecodeFailure { kind: DecodeFailureKind::Shape, .. })
        );
        assert_matches!(
            decode(r#"{"timestamp":"2024-01-01T00:00:00Z","data":{}}"#),
            Err(DecodeFailure { kind: DecodeFailureKind::Shape, .. })
        );
        assert_matches!(
            decode(r#"{"id":"1","timestamp":"2024-01-01T00:00:00Z"}"#),
            Err(DecodeFailure { kind: DecodeFailureKind::Shape, .. })
        );
    }

    #[test]
    fn bad_timestamp_is_shape_failure() {
        let failure = decode(r#"{"id":"1","timestamp":"yesterday","data":{}}"#).unwrap_err();
        assert_eq!(failure.kind, DecodeFailureKind::Shape);
    }

    #[test]
    fn empty_id_is_rejected() {
        let failure = decode(r#"{"id":"","timestamp":"2024-01-01T00:00:00Z","data":{}}"#).unwrap_err();
        assert_eq!(failure.kind, DecodeFailureKind::Shape);
        assert!(failure.reason.contains("empty"));
    }

    #[test]
    fn non_object_json_is_shape_failure() {
        assert_matches!(decode("[1,2,3]"), Err(DecodeFailure { kind: DecodeFailureKind::Shape, .. }));
    }

    #[test]
    fn long_payload_preview_is_truncated() {
        let payload = format!("{{\"id\":\"{}\"", "x".repeat(200));
        let failure = decode(&payload).unwrap_err();
        assert!(failure.preview.ends_with('…'));
        assert_eq!(failure.preview.chars().count(), PREVIEW_LIMIT + 1);
    }

    #[test]
    fn display_includes_kind() {
        let failure = decode("{").unwrap_err();
        assert!(failure.to_string().starts_with("malformed frame:"));
    }

    #[test]
    fn typed_feedback_payload() {
        let decoder = EnvelopeDecoder::<Feedback>::new();
        let env = decoder
            .decode(
                br#"{"id":"evt-1","timestamp":"2024-01-01T00:00:00Z","data":{
                    "id":"fb-1","email":"a@b.c","description":"broken button",
                    "feedbackType":"bug","createdAt":"2024-01-01T00:00:00Z",
                    "updatedAt":"2024-01-01T00:00:00Z"}}"#,
            )
            .unwrap();
        assert_eq!(env.data.id, "fb-1");
        assert_eq!(env.data.feedback_type, FeedbackType::Bug);
    }

    #[test]
    fn typed_payload_with_wrong_shape_fails() {
        let decoder = EnvelopeDecoder::<Feedback>::new();
        let failure = decoder
            .decode(br#"{"id":"evt-1","timestamp":"2024-01-01T00:00:00Z","data":{"id":"fb-1"}}"#)
            .unwrap_err();
        assert_eq!(failure.kind, DecodeFailureKind::Shape);
    }

    proptest! {
        #[test]
        fn decode_never_panics(payload in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = EnvelopeDecoder::<serde_json::Value>::new().decode(&payload);
        }

        #[test]
        fn well_formed_ids_survive(id in "[a-zA-Z0-9-]{1,24}") {
            let payload = format!(
                r#"{{"id":"{id}","timestamp":"2024-01-01T00:00:00Z","data":null}}"#
            );
            let env = EnvelopeDecoder::<serde_json::Value>::new().decode(payload.as_bytes()).unwrap();
            prop_assert_eq!(env.id, id);
        }
    }
}
