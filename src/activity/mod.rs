//! Activity window tracker.
//!
//! Remembers when we last responded in each conversation and answers "is
//! this conversation currently active?". It is an advisory cache: a missing
//! or stale record only changes whether one redundant acknowledgement is
//! sent, never business state.
//!
//! Expiry is checked lazily on every read, so a record is dead the instant
//! its TTL elapses regardless of when the background sweep last ran. The
//! sweep only bounds memory.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::ActivityConfig;
use crate::scheduling::ScheduledTask;
use crate::types::ConversationId;

/// Last-response timestamp for one conversation.
#[derive(Debug, Clone, Copy)]
pub struct ActivityRecord {
    pub last_response_at: Instant,
    pub ttl: Duration,
}

impl ActivityRecord {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_response_at) >= self.ttl
    }
}

/// Per-conversation activity records with a TTL.
#[derive(Debug)]
pub struct ActivityTracker {
    ttl: Duration,
    records: DashMap<ConversationId, ActivityRecord>,
}

impl ActivityTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: DashMap::new(),
        }
    }

    pub fn from_config(config: &ActivityConfig) -> Self {
        Self::new(config.ttl())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record that a response was just dispatched.
    pub fn mark_active(&self, id: &ConversationId) {
        self.records.insert(
            id.clone(),
            ActivityRecord {
                last_response_at: Instant::now(),
                ttl: self.ttl,
            },
        );
    }

    /// Whether we responded within the TTL. Expired records are evicted.
    pub fn is_active(&self, id: &ConversationId) -> bool {
        let now = Instant::now();
        let active = match self.records.get(id) {
            Some(record) => !record.is_expired(now),
            None => return false,
        };
        if !active {
            self.records.remove_if(id, |_, record| record.is_expired(now));
        }
        active
    }

    /// Time since our last response, or `None` if inactive.
    pub fn time_since_last_response(&self, id: &ConversationId) -> Option<Duration> {
        if !self.is_active(id) {
            return None;
        }
        self.records
            .get(id)
            .map(|record| record.last_response_at.elapsed())
    }

    /// Evict every expired record. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            log::debug!("Activity sweep evicted {} expired record(s)", removed);
        }
        removed
    }

    /// Number of records currently held, expired or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the returned task
    /// is cancelled or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> ScheduledTask {
        let tracker = Arc::downgrade(self);
        ScheduledTask::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match tracker.upgrade() {
                    Some(tracker) => {
                        tracker.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}
