//! Hierarchical, dot-delimited topic names.
//!
//! Topics follow the NATS subject grammar used by the backend broker:
//!
//! - tokens are separated by `.` and may not be empty
//! - `*` as a whole token matches exactly one token
//! - `>` as the final token matches one or more trailing tokens
//!
//! Concrete subjects (no wildcards) are what frames arrive on; wildcard
//! topics are only meaningful as subscriptions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Single-token wildcard.
pub const WILDCARD_ONE: &str = "*";
/// Trailing multi-token wildcard.
pub const WILDCARD_TAIL: &str = ">";

/// Errors produced when validating a topic.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TopicError {
    /// The topic string was empty.
    #[error("topic is empty")]
    Empty,
    /// Two consecutive dots, or a leading/trailing dot.
    #[error("topic `{0}` contains an empty token")]
    EmptyToken(String),
    /// Whitespace or a wildcard character embedded in a token.
    #[error("topic `{topic}` contains invalid character {ch:?}")]
    InvalidCharacter {
        /// The rejected topic.
        topic: String,
        /// The offending character.
        ch: char,
    },
    /// `>` used anywhere but the final token.
    #[error("topic `{0}` uses `>` before the final token")]
    MisplacedTail(String),
    /// A record, branch or organization id that is not one concrete token.
    #[error("`{0}` is not a single topic token")]
    NotAToken(String),
}

/// A validated topic name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    /// Validate and wrap a topic string.
    pub fn new(topic: impl Into<String>) -> Result<Self, TopicError> {
        let topic = topic.into();
        validate(&topic)?;
        Ok(Self(topic))
    }

    /// The topic as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the dot-separated tokens.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Whether the topic contains `*` or `>` tokens.
    pub fn is_wildcard(&self) -> bool {
        self.tokens().any(|t| t == WILDCARD_ONE || t == WILDCARD_TAIL)
    }

    /// Append a token, producing a deeper topic.
    pub fn child(&self, token: &str) -> Result<Self, TopicError> {
        Self::new(format!("{}.{token}", self.0))
    }

    /// Whether a concrete `subject` falls under this topic.
    ///
    /// A concrete topic only matches itself. A wildcard subject never
    /// matches: frames always arrive on concrete subjects.
    pub fn matches(&self, subject: &Topic) -> bool {
        if subject.is_wildcard() {
            return false;
        }
        let mut pattern = self.tokens();
        let mut concrete = subject.tokens();
        loop {
            match (pattern.next(), concrete.next()) {
                (Some(WILDCARD_TAIL), Some(_)) => return true,
                (Some(WILDCARD_ONE), Some(_)) => {}
                (Some(p), Some(s)) if p == s => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

fn validate(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    let token_count = topic.split('.').count();
    for (index, token) in topic.split('.').enumerate() {
        if token.is_empty() {
            return Err(TopicError::EmptyToken(topic.to_owned()));
        }
        if token == WILDCARD_TAIL {
            if index + 1 != token_count {
                return Err(TopicError::MisplacedTail(topic.to_owned()));
            }
            continue;
        }
        if token == WILDCARD_ONE {
            continue;
        }
        if let Some(ch) = token
            .chars()
            .find(|c| c.is_whitespace() || *c == '*' || *c == '>')
        {
            return Err(TopicError::InvalidCharacter {
                topic: topic.to_owned(),
                ch,
            });
        }
    }
    Ok(())
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Topic {
    type Error = TopicError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entity broadcast subjects
// ─────────────────────────────────────────────────────────────────────────────

/// The kind of change a broadcast subject announces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Entity was created.
    Created,
    /// Entity was updated.
    Updated,
    /// Entity was deleted.
    Deleted,
}

impl ChangeKind {
    /// All change kinds, in lifecycle order.
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Created, ChangeKind::Updated, ChangeKind::Deleted];

    /// The action token used in subjects (`create`, `update`, `delete`).
    pub fn action(self) -> &'static str {
        match self {
            Self::Created => "create",
            Self::Updated => "update",
            Self::Deleted => "delete",
        }
    }

    /// Parse an action token.
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "create" => Some(Self::Created),
            "update" => Some(Self::Updated),
            "delete" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Read the change kind from a subject such as `feedback.update.42`.
    pub fn from_topic(topic: &Topic) -> Option<Self> {
        topic.tokens().nth(1).and_then(Self::from_action)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action())
    }
}

/// Builds the subjects an entity's create/update/delete broadcasts go out on.
///
/// The backend publishes one change on several subjects at once:
///
/// ```text
/// <entity>.<action>
/// <entity>.<action>.<id>
/// <entity>.<action>.branch.<branch_id>
/// <entity>.<action>.organization.<organization_id>
/// ```
///
/// A subscription that should see each change exactly once must therefore
/// pick one of those shapes. [`EntityTopics::actions`] and the scoped
/// `*_actions` builders do that; `<entity>.>` would see every change once
/// per shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityTopics {
    entity: Topic,
}

const BRANCH: &str = "branch";
const ORGANIZATION: &str = "organization";

impl EntityTopics {
    /// Subjects for an arbitrary entity name (must be a concrete topic).
    pub fn new(entity: &str) -> Result<Self, TopicError> {
        let entity = Topic::new(entity)?;
        if entity.is_wildcard() {
            let ch = if entity.tokens().any(|t| t == WILDCARD_TAIL) { '>' } else { '*' };
            return Err(TopicError::InvalidCharacter {
                topic: entity.into(),
                ch,
            });
        }
        Ok(Self { entity })
    }

    /// Subjects for the feedback resource.
    pub fn feedback() -> Self {
        Self {
            entity: Topic("feedback".to_owned()),
        }
    }

    /// The entity root, e.g. `feedback`.
    pub fn entity(&self) -> &Topic {
        &self.entity
    }

    /// `<entity>.<action>` for every change of that kind.
    pub fn changes(&self, kind: ChangeKind) -> Topic {
        Topic(format!("{}.{}", self.entity, kind.action()))
    }

    /// `<entity>.<action>.<id>` for one record.
    pub fn changes_for(&self, kind: ChangeKind, id: &str) -> Result<Topic, TopicError> {
        Ok(Topic(format!("{}.{}", self.changes(kind), token(id)?)))
    }

    /// `<entity>.<action>.branch.<branch_id>` for one branch's records.
    pub fn changes_for_branch(&self, kind: ChangeKind, branch_id: &str) -> Result<Topic, TopicError> {
        self.scoped(kind.action(), BRANCH, branch_id)
    }

    /// `<entity>.<action>.organization.<organization_id>` for one organization's records.
    pub fn changes_for_organization(
        &self,
        kind: ChangeKind,
        organization_id: &str,
    ) -> Result<Topic, TopicError> {
        self.scoped(kind.action(), ORGANIZATION, organization_id)
    }

    /// `<entity>.create`.
    pub fn created(&self) -> Topic {
        self.changes(ChangeKind::Created)
    }

    /// `<entity>.update`.
    pub fn updated(&self) -> Topic {
        self.changes(ChangeKind::Updated)
    }

    /// `<entity>.delete`.
    pub fn deleted(&self) -> Topic {
        self.changes(ChangeKind::Deleted)
    }

    /// `<entity>.*`: every change, once.
    pub fn actions(&self) -> Topic {
        Topic(format!("{}.{WILDCARD_ONE}", self.entity))
    }

    /// `<entity>.*.branch.<branch_id>`: every change in one branch, once.
    pub fn branch_actions(&self, branch_id: &str) -> Result<Topic, TopicError> {
        self.scoped(WILDCARD_ONE, BRANCH, branch_id)
    }

    /// `<entity>.*.organization.<organization_id>`: every change in one organization, once.
    pub fn organization_actions(&self, organization_id: &str) -> Result<Topic, TopicError> {
        self.scoped(WILDCARD_ONE, ORGANIZATION, organization_id)
    }

    fn scoped(&self, action: &str, scope: &str, id: &str) -> Result<Topic, TopicError> {
        Ok(Topic(format!("{}.{action}.{scope}.{}", self.entity, token(id)?)))
    }
}

/// Accept `id` only as one concrete token, so scoped and per-record subjects
/// cannot collide.
fn token(id: &str) -> Result<&str, TopicError> {
    let topic = Topic::new(id)?;
    if topic.is_wildcard() || topic.tokens().count() != 1 {
        return Err(TopicError::NotAToken(id.to_owned()));
    }
    Ok(id)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
