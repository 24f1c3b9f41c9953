//! # turnpace
//!
//! Conversational turn and persuasion timing for chat-based sales agents.
//!
//! Inbound fragments are coalesced into logical turns, at most one turn per
//! conversation is processed at a time, replies are paced to look human
//! (reading pause, typing indicator, typing pause), and conversations that
//! go quiet receive an escalating sequence of follow-up messages that stops
//! the moment the user replies.
//!
//! The orchestrator talks to the outside world only through the traits in
//! [`interfaces`]; an HTTP ingress lives in [`server`].

pub mod activity;
pub mod config;
pub mod error;
pub mod events;
pub mod interfaces;
pub mod orchestrator;
pub mod pacing;
pub mod persuasion;
pub mod scheduling;
pub mod server;
pub mod turns;
pub mod types;

pub use activity::ActivityTracker;
pub use config::OrchestratorConfig;
pub use error::{CollaboratorError, ConfigError, TurnError};
pub use events::{EventBus, OrchestratorEvent};
pub use interfaces::{
    Collaborators, MessageTransport, ProfileStore, ResponseGenerator, TurnClassifier,
};
pub use orchestrator::{ConversationStatus, Orchestrator, OrchestratorOptions, TurnOutcome};
pub use pacing::{DelayModel, PacingPlan};
pub use persuasion::{ArmOutcome, PersuasionSequencer, TemplateBook};
pub use turns::{AdmissionGuard, TurnAggregator};
pub use types::{
    Archetype, ConversationId, ConversationProfile, Fragment, FragmentKind, LogicalTurn,
    TurnLabels,
};

/// Library version.
pub const VERSION: &str = "0.4.0";
