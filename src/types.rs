//! Core value types shared by every orchestrator component.
//!
//! Everything here is plain data: conversation keys, inbound fragments,
//! coalesced logical turns, and the labels an external classifier attaches
//! to a turn.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// ConversationId
// ---------------------------------------------------------------------------

/// Opaque, stable key for one end-user conversation.
///
/// Cheap to clone: the underlying string is reference counted because the
/// same key is copied into every per-conversation map and timer task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ConversationId(Arc<str>);

impl ConversationId {
    /// Create a new conversation id from any string-like value.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<ConversationId> for String {
    fn from(value: ConversationId) -> Self {
        value.0.to_string()
    }
}

// ---------------------------------------------------------------------------
// Fragments and turns
// ---------------------------------------------------------------------------

/// What kind of payload an inbound fragment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    /// Plain chat text; subject to coalescing.
    #[default]
    Text,
    /// Voice note (already transcribed upstream).
    Voice,
    /// Image, document or other attachment.
    Media,
}

impl FragmentKind {
    /// Voice and media carry their own latency and are never debounced.
    pub fn bypasses_aggregation(&self) -> bool {
        !matches!(self, FragmentKind::Text)
    }
}

/// One raw inbound message piece as received from the gateway.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub text: String,
    pub kind: FragmentKind,
    pub arrived_at: Instant,
}

impl Fragment {
    /// A text fragment that arrived now.
    pub fn text(text: impl Into<String>) -> Self {
        Self::at(text, Instant::now())
    }

    /// A text fragment with an explicit arrival time.
    pub fn at(text: impl Into<String>, arrived_at: Instant) -> Self {
        Self {
            text: text.into(),
            kind: FragmentKind::Text,
            arrived_at,
        }
    }

    /// Builder: set the fragment kind.
    pub fn with_kind(mut self, kind: FragmentKind) -> Self {
        self.kind = kind;
        self
    }
}

/// One coherent unit of user input, possibly assembled from several
/// rapidly-sent fragments.
#[derive(Debug, Clone)]
pub struct LogicalTurn {
    pub conversation_id: ConversationId,
    /// The text handed to the classifier and generator.
    pub text: String,
    pub kind: FragmentKind,
    /// Number of fragments that contributed to `text`.
    pub fragment_count: usize,
    /// Earlier fragments dropped because they were separated by a long pause.
    pub discarded: usize,
    pub first_arrived_at: Instant,
    pub last_arrived_at: Instant,
}

impl LogicalTurn {
    /// Whether more than one fragment was merged into this turn.
    pub fn is_merged(&self) -> bool {
        self.fragment_count > 1
    }

    /// A single-fragment turn, used for bypassing media and for tests.
    pub fn single(conversation_id: ConversationId, fragment: Fragment) -> Self {
        Self {
            conversation_id,
            text: fragment.text,
            kind: fragment.kind,
            fragment_count: 1,
            discarded: 0,
            first_arrived_at: fragment.arrived_at,
            last_arrived_at: fragment.arrived_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Classification labels
// ---------------------------------------------------------------------------

/// Persuasion archetype used to pick follow-up message variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    Analytical,
    Emotional,
    Pragmatic,
    Skeptical,
    #[default]
    Unknown,
}

impl fmt::Display for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Archetype::Analytical => "analytical",
            Archetype::Emotional => "emotional",
            Archetype::Pragmatic => "pragmatic",
            Archetype::Skeptical => "skeptical",
            Archetype::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    #[default]
    Neutral,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
}

/// Labels produced by the external turn classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnLabels {
    pub sentiment: Sentiment,
    pub urgency: Urgency,
    /// Engagement score in `[0.0, 1.0]`.
    pub engagement: f32,
    pub archetype: Archetype,
    /// The conversation reached a stage that warrants follow-ups if the
    /// user goes quiet.
    pub follow_up_eligible: bool,
}

impl Default for TurnLabels {
    fn default() -> Self {
        Self {
            sentiment: Sentiment::Neutral,
            urgency: Urgency::Normal,
            engagement: 0.5,
            archetype: Archetype::Unknown,
            follow_up_eligible: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// Business fields the orchestrator reads from and writes to the profile
/// store. The store owns the schema; this is only the projection we use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationProfile {
    pub conversation_id: Option<ConversationId>,
    pub engagement: f32,
    pub last_seen: Option<DateTime<Utc>>,
    pub turns: u32,
    pub follow_up_attempts: u32,
    pub abandoned: bool,
    pub last_archetype: Option<Archetype>,
}
