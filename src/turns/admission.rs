//! Turn admission guard: single-flight per conversation.
//!
//! `try_admit` is a non-blocking test-and-set. The returned token releases
//! the conversation when dropped, so every exit path of the turn pipeline
//! (success, error, early return, panic unwinding) frees it.

use std::fmt;
use std::sync::Arc;

use dashmap::DashSet;

use crate::types::ConversationId;

/// Registry of conversations that currently have a turn in flight.
#[derive(Debug, Clone, Default)]
pub struct AdmissionGuard {
    held: Arc<DashSet<ConversationId>>,
}

/// Lease proving the holder is the only turn in flight for a conversation.
#[must_use = "dropping the token releases the conversation immediately"]
pub struct AdmissionToken {
    conversation_id: ConversationId,
    held: Arc<DashSet<ConversationId>>,
}

impl AdmissionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a turn for `id`, or `None` if one is already in flight.
    pub fn try_admit(&self, id: &ConversationId) -> Option<AdmissionToken> {
        if self.held.insert(id.clone()) {
            Some(AdmissionToken {
                conversation_id: id.clone(),
                held: Arc::clone(&self.held),
            })
        } else {
            log::debug!("[{}] admission refused: turn already in flight", id);
            None
        }
    }

    /// Explicit release; equivalent to dropping the token.
    pub fn release(&self, token: AdmissionToken) {
        drop(token);
    }

    pub fn is_held(&self, id: &ConversationId) -> bool {
        self.held.contains(id)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

impl AdmissionToken {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }
}

impl fmt::Debug for AdmissionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AdmissionToken({})", self.conversation_id)
    }
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        self.held.remove(&self.conversation_id);
    }
}
