//! Lifecycle events published by the orchestrator.
//!
//! The bus is a thin wrapper over a `tokio::sync::broadcast` channel.
//! Publishing never blocks and never fails: with no subscribers the event
//! is simply dropped, and slow subscribers observe `Lagged` rather than
//! slowing down a conversation.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::persuasion::EscalationTier;
use crate::types::{Archetype, ConversationId};

/// Something observable happened to a conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// The aggregator emitted a logical turn.
    TurnEmitted {
        conversation_id: ConversationId,
        text: String,
        fragment_count: usize,
        discarded: usize,
    },
    /// A turn was refused because another one is in flight.
    TurnDropped { conversation_id: ConversationId },
    /// A turn failed at some stage; nothing was committed.
    TurnAbandoned {
        conversation_id: ConversationId,
        stage: &'static str,
        error: String,
    },
    /// A paced response was delivered.
    ResponseSent {
        conversation_id: ConversationId,
        delay_ms: u64,
    },
    /// An "I'm here" acknowledgement was delivered during slow generation.
    AcknowledgementSent { conversation_id: ConversationId },
    SequenceArmed {
        conversation_id: ConversationId,
        sequence_id: Uuid,
        archetype: Archetype,
        max_tier: EscalationTier,
        superseded: Option<Uuid>,
    },
    /// Arming was refused because the conversation is cooling down.
    ArmSuppressed {
        conversation_id: ConversationId,
        remaining_secs: u64,
    },
    FollowUpFired {
        conversation_id: ConversationId,
        sequence_id: Uuid,
        level: u8,
        tier: EscalationTier,
    },
    SequenceCancelled {
        conversation_id: ConversationId,
        sequence_id: Uuid,
        fired_levels: u8,
    },
    /// The last level fired without a reply; the conversation is abandoned.
    SequenceCompleted {
        conversation_id: ConversationId,
        sequence_id: Uuid,
    },
    ApologySent { conversation_id: ConversationId },
}

impl OrchestratorEvent {
    /// The conversation this event belongs to.
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            OrchestratorEvent::TurnEmitted { conversation_id, .. }
            | OrchestratorEvent::TurnDropped { conversation_id }
            | OrchestratorEvent::TurnAbandoned { conversation_id, .. }
            | OrchestratorEvent::ResponseSent { conversation_id, .. }
            | OrchestratorEvent::AcknowledgementSent { conversation_id }
            | OrchestratorEvent::SequenceArmed { conversation_id, .. }
            | OrchestratorEvent::ArmSuppressed { conversation_id, .. }
            | OrchestratorEvent::FollowUpFired { conversation_id, .. }
            | OrchestratorEvent::SequenceCancelled { conversation_id, .. }
            | OrchestratorEvent::SequenceCompleted { conversation_id, .. }
            | OrchestratorEvent::ApologySent { conversation_id } => conversation_id,
        }
    }
}

/// Cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn emit(&self, event: OrchestratorEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
