//! Process-local profile store.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::ProfileStore;
use crate::error::CollaboratorError;
use crate::types::{ConversationId, ConversationProfile, TurnLabels};

/// Profiles kept in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    profiles: DashMap<ConversationId, ConversationProfile>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a stored profile, if any.
    pub fn get(&self, id: &ConversationId) -> Option<ConversationProfile> {
        self.profiles.get(id).map(|p| p.clone())
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    fn fresh(id: &ConversationId) -> ConversationProfile {
        ConversationProfile {
            conversation_id: Some(id.clone()),
            ..ConversationProfile::default()
        }
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn load_profile(&self, id: &ConversationId) -> Result<ConversationProfile, CollaboratorError> {
        Ok(self.get(id).unwrap_or_else(|| Self::fresh(id)))
    }

    async fn record_turn(&self, id: &ConversationId, labels: &TurnLabels) -> Result<(), CollaboratorError> {
        let mut profile = self
            .profiles
            .entry(id.clone())
            .or_insert_with(|| Self::fresh(id));
        profile.turns += 1;
        profile.engagement = labels.engagement.clamp(0.0, 1.0);
        profile.last_seen = Some(Utc::now());
        profile.last_archetype = Some(labels.archetype);
        // A reply revives an abandoned conversation.
        profile.abandoned = false;
        Ok(())
    }

    async fn record_follow_up(&self, id: &ConversationId, level: u8) -> Result<(), CollaboratorError> {
        let mut profile = self
            .profiles
            .entry(id.clone())
            .or_insert_with(|| Self::fresh(id));
        profile.follow_up_attempts += 1;
        log::debug!("[{}] follow-up level {} recorded", id, level);
        Ok(())
    }

    async fn mark_abandoned(&self, id: &ConversationId) -> Result<(), CollaboratorError> {
        self.profiles
            .entry(id.clone())
            .or_insert_with(|| Self::fresh(id))
            .abandoned = true;
        Ok(())
    }
}
