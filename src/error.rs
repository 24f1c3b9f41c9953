//! Error types for the orchestrator and its collaborators.
//!
//! None of these ever reach the end user: a failed turn results in silence,
//! and timer-registry races (cancel of an unknown conversation) are not
//! errors at all.

use thiserror::Error;

use crate::types::ConversationId;

/// Errors reported by external collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The outbound transport could not deliver a message.
    #[error("Delivery to {conversation_id} failed: {message}")]
    Delivery {
        conversation_id: ConversationId,
        message: String,
    },

    /// The turn classifier failed.
    #[error("Classifier error: {0}")]
    Classifier(String),

    /// The response generator failed or returned nothing usable.
    #[error("Generator error: {0}")]
    Generator(String),

    /// The profile store failed.
    #[error("Profile store error: {0}")]
    Store(String),

    /// An HTTP call to a collaborator failed.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl CollaboratorError {
    /// Convenience constructor for delivery failures.
    pub fn delivery(conversation_id: &ConversationId, message: impl Into<String>) -> Self {
        Self::Delivery {
            conversation_id: conversation_id.clone(),
            message: message.into(),
        }
    }
}

/// Why a logical turn was abandoned for this cycle.
///
/// A turn is all-or-nothing: whichever stage fails, nothing is committed
/// (no activity mark, no follow-up arm).
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("classification failed: {0}")]
    Classification(#[source] CollaboratorError),

    #[error("generation failed: {0}")]
    Generation(#[source] CollaboratorError),

    #[error("generator returned an empty reply")]
    EmptyReply,

    #[error("delivery failed: {0}")]
    Delivery(#[source] CollaboratorError),

    #[error("profile lookup failed: {0}")]
    Profile(#[source] CollaboratorError),
}

impl TurnError {
    /// Short stage name used in logs and events.
    pub fn stage(&self) -> &'static str {
        match self {
            TurnError::Classification(_) => "classify",
            TurnError::Generation(_) | TurnError::EmptyReply => "generate",
            TurnError::Delivery(_) => "deliver",
            TurnError::Profile(_) => "profile",
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}
