//! The feedback entity broadcast by the feedback service.
//!
//! Matches the JSON bodies of the REST collaborator (`/feedback`), which are
//! also the `data` of feedback broadcasts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category a user picked for their feedback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackType {
    /// Something is broken.
    Bug,
    /// A feature request.
    Feature,
    /// Anything else.
    General,
    /// A category this client does not know yet.
    #[serde(other)]
    Other,
}

/// One feedback record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    /// Record identifier.
    pub id: String,
    /// Submitter's email.
    pub email: String,
    /// Free-form text.
    pub description: String,
    /// Category.
    pub feedback_type: FeedbackType,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}
