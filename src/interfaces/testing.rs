//! In-process collaborator doubles for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{MessageTransport, ResponseGenerator, TurnClassifier};
use crate::error::CollaboratorError;
use crate::types::{ConversationId, ConversationProfile, LogicalTurn, TurnLabels};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outbound {
    Text(String),
    Typing(bool),
    Read,
}

#[derive(Debug, Clone)]
pub(crate) struct Sent {
    pub conversation_id: ConversationId,
    pub what: Outbound,
    pub at: Instant,
}

/// Records everything sent through it.
#[derive(Debug, Default)]
pub(crate) struct RecordingTransport {
    log: Mutex<Vec<Sent>>,
    fail_sends: AtomicBool,
    stall_sends: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make text sends hang forever, like an unresponsive gateway.
    pub fn stall_sends(&self, stall: bool) {
        self.stall_sends.store(stall, Ordering::SeqCst);
    }

    pub fn log(&self) -> Vec<Sent> {
        self.log.lock().clone()
    }

    /// Text messages sent to `id`, in order.
    pub fn texts(&self, id: &str) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|s| s.conversation_id.as_str() == id)
            .filter_map(|s| match &s.what {
                Outbound::Text(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, id: &ConversationId, what: Outbound) {
        self.log.lock().push(Sent {
            conversation_id: id.clone(),
            what,
            at: Instant::now(),
        });
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn send(&self, id: &ConversationId, text: &str) -> Result<(), CollaboratorError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CollaboratorError::delivery(id, "gateway unavailable"));
        }
        if self.stall_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.push(id, Outbound::Text(text.to_string()));
        Ok(())
    }

    async fn set_typing(&self, id: &ConversationId, on: bool) -> Result<(), CollaboratorError> {
        self.push(id, Outbound::Typing(on));
        Ok(())
    }

    async fn mark_read(&self, id: &ConversationId) -> Result<(), CollaboratorError> {
        self.push(id, Outbound::Read);
        Ok(())
    }
}

/// Returns the same labels for every turn.
#[derive(Debug, Clone, Default)]
pub(crate) struct StaticClassifier {
    pub labels: TurnLabels,
}

#[async_trait]
impl TurnClassifier for StaticClassifier {
    async fn classify(
        &self,
        _turn: &LogicalTurn,
        _profile: &ConversationProfile,
    ) -> Result<TurnLabels, CollaboratorError> {
        Ok(self.labels.clone())
    }
}

/// Echoes the turn text after an optional delay, or fails on demand.
#[derive(Debug, Default)]
pub(crate) struct ScriptedGenerator {
    pub latency: Duration,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        let generator = Self::default();
        generator.fail.store(true, Ordering::SeqCst);
        generator
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        turn: &LogicalTurn,
        _labels: &TurnLabels,
        _profile: &ConversationProfile,
    ) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(turn.text.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Generator("model unavailable".to_string()));
        }
        Ok(format!("re: {}", turn.text))
    }
}
