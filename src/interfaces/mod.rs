//! # Collaborator interfaces
//!
//! The orchestrator owns timing only. Everything it talks to lives behind
//! one of these traits:
//!
//! ```text
//! Orchestrator
//!   ├── MessageTransport   (send text, typing indicator, read receipts)
//!   ├── TurnClassifier     (sentiment, urgency, engagement, archetype)
//!   ├── ResponseGenerator  (reply text for a logical turn)
//!   └── ProfileStore       (conversation history and counters)
//! ```
//!
//! Default implementations:
//!
//! - [`InMemoryProfileStore`]: process-local profiles in a `DashMap`
//! - [`LexicalClassifier`]: keyword heuristics, no network calls
//! - [`HttpTransport`]: POSTs to a messaging gateway
//! - [`ChatCompletionsGenerator`]: OpenAI-compatible chat completions API

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CollaboratorError;
use crate::types::{ConversationId, ConversationProfile, LogicalTurn, TurnLabels};

pub mod classifier;
pub mod http;
pub mod memory_store;

#[cfg(test)]
pub(crate) mod testing;

pub use classifier::LexicalClassifier;
pub use http::{ChatCompletionsGenerator, GeneratorSettings, HttpTransport};
pub use memory_store::InMemoryProfileStore;

/// Outbound messaging channel.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Deliver `text` to the conversation.
    async fn send(&self, id: &ConversationId, text: &str) -> Result<(), CollaboratorError>;

    /// Toggle the "typing..." indicator. Best effort.
    async fn set_typing(&self, _id: &ConversationId, _on: bool) -> Result<(), CollaboratorError> {
        Ok(())
    }

    /// Mark the user's latest message as read. Best effort.
    async fn mark_read(&self, _id: &ConversationId) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Labels a logical turn.
#[async_trait]
pub trait TurnClassifier: Send + Sync {
    async fn classify(
        &self,
        turn: &LogicalTurn,
        profile: &ConversationProfile,
    ) -> Result<TurnLabels, CollaboratorError>;
}

/// Produces the reply text for a logical turn.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(
        &self,
        turn: &LogicalTurn,
        labels: &TurnLabels,
        profile: &ConversationProfile,
    ) -> Result<String, CollaboratorError>;
}

/// Persistent per-conversation history.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Load the profile, or a fresh default one for unseen conversations.
    async fn load_profile(&self, id: &ConversationId) -> Result<ConversationProfile, CollaboratorError>;

    /// Record a completed turn and its labels.
    async fn record_turn(&self, id: &ConversationId, labels: &TurnLabels) -> Result<(), CollaboratorError>;

    /// Record that follow-up `level` was sent.
    async fn record_follow_up(&self, id: &ConversationId, level: u8) -> Result<(), CollaboratorError>;

    /// The whole follow-up sequence fired without a reply.
    async fn mark_abandoned(&self, id: &ConversationId) -> Result<(), CollaboratorError>;
}

/// The set of collaborators an orchestrator is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn MessageTransport>,
    pub classifier: Arc<dyn TurnClassifier>,
    pub generator: Arc<dyn ResponseGenerator>,
    pub store: Arc<dyn ProfileStore>,
}

impl Collaborators {
    /// Wire a transport and generator to the built-in classifier and an
    /// in-memory profile store.
    pub fn with_defaults(
        transport: Arc<dyn MessageTransport>,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        Self {
            transport,
            classifier: Arc::new(LexicalClassifier::new()),
            generator,
            store: Arc::new(InMemoryProfileStore::new()),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
