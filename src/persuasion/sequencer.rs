//! Persuasion sequencer.
//!
//! After an eligible turn the sequencer arms a follow-up sequence: up to
//! seven messages at fixed offsets from arm time, escalating in intensity.
//! Any user message cancels the sequence. An irritated one suppresses
//! re-arming for a cool-down period and, when it answers follow-ups, earns
//! a single apology sent in the background.
//!
//! ```text
//! Idle ──arm──► Armed ──L1..L6──► Armed ──L7──► Completed (abandoned)
//!                 │
//!                 └──user message / cancel──► Cancelled
//! ```
//!
//! Each armed sequence has one driver task that walks its levels in order.
//! Firing a level happens under the conversation's map entry: the driver
//! re-checks the sequence id and state, marks the level fired, and only
//! then sends outside the lock. The send itself runs in a separate task so
//! that cancelling the driver never interrupts a message already on its way.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use super::irritation::{self, IrritationSignal};
use super::templates::{EscalationTier, TemplateBook};
use crate::config::PersuasionConfig;
use crate::events::{EventBus, OrchestratorEvent};
use crate::interfaces::{MessageTransport, ProfileStore};
use crate::scheduling::ScheduledTask;
use crate::types::{Archetype, ConversationId};

// ---------------------------------------------------------------------------
// Sequence state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceState {
    Armed,
    /// The last level fired without a reply.
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelStatus {
    Pending,
    Fired,
    /// Already due when the sequence was restored; never replayed.
    Skipped,
}

/// One follow-up level of a sequence.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledLevel {
    pub level: u8,
    pub tier: EscalationTier,
    pub offset_secs: u64,
    pub status: LevelStatus,
    #[serde(skip)]
    due_at: Instant,
}

/// A live follow-up sequence for one conversation.
#[derive(Debug)]
pub struct FollowUpSequence {
    pub sequence_id: Uuid,
    pub conversation_id: ConversationId,
    pub archetype: Archetype,
    pub max_tier: EscalationTier,
    pub started_at: DateTime<Utc>,
    pub state: SequenceState,
    pub levels: Vec<ScheduledLevel>,
    driver: Option<ScheduledTask>,
}

impl FollowUpSequence {
    pub fn fired_levels(&self) -> u8 {
        self.levels
            .iter()
            .filter(|l| l.status == LevelStatus::Fired)
            .count() as u8
    }

    fn next_pending(&self) -> Option<&ScheduledLevel> {
        self.levels.iter().find(|l| l.status == LevelStatus::Pending)
    }

    pub fn snapshot(&self) -> SequenceSnapshot {
        let next = self.next_pending();
        SequenceSnapshot {
            sequence_id: self.sequence_id,
            conversation_id: self.conversation_id.clone(),
            archetype: self.archetype,
            max_tier: self.max_tier,
            state: self.state,
            fired_levels: self.fired_levels(),
            next_level: next.map(|l| l.level),
            next_due_in_secs: next.map(|l| l.due_at.saturating_duration_since(Instant::now()).as_secs()),
            started_at: self.started_at,
            levels: self.levels.clone(),
        }
    }
}

/// Point-in-time view of a sequence.
#[derive(Debug, Clone, Serialize)]
pub struct SequenceSnapshot {
    pub sequence_id: Uuid,
    pub conversation_id: ConversationId,
    pub archetype: Archetype,
    pub max_tier: EscalationTier,
    pub state: SequenceState,
    pub fired_levels: u8,
    pub next_level: Option<u8>,
    pub next_due_in_secs: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub levels: Vec<ScheduledLevel>,
}

/// Result of [`PersuasionSequencer::arm`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ArmOutcome {
    Armed {
        sequence_id: Uuid,
        max_tier: EscalationTier,
    },
    /// A live sequence existed and was cancelled in favour of the new one.
    Superseded {
        sequence_id: Uuid,
        max_tier: EscalationTier,
        previous: SequenceSnapshot,
    },
    /// The conversation is cooling down after an irritated reply.
    Suppressed { remaining_secs: u64 },
    /// Every level was already due at restore time; nothing was scheduled.
    Exhausted,
}

impl ArmOutcome {
    pub fn sequence_id(&self) -> Option<Uuid> {
        match self {
            ArmOutcome::Armed { sequence_id, .. } | ArmOutcome::Superseded { sequence_id, .. } => {
                Some(*sequence_id)
            }
            ArmOutcome::Suppressed { .. } | ArmOutcome::Exhausted => None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.sequence_id().is_some()
    }
}

/// What happened when a user message reached the sequencer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserMessageOutcome {
    /// The sequence the message cancelled, if one was live.
    pub cancelled: Option<SequenceSnapshot>,
    pub irritation: Option<IrritationSignal>,
    /// An apology was handed to the transport in the background.
    pub apology_queued: bool,
}

// ---------------------------------------------------------------------------
// Sequencer
// ---------------------------------------------------------------------------

struct SequencerInner {
    config: PersuasionConfig,
    templates: TemplateBook,
    transport: Arc<dyn MessageTransport>,
    store: Arc<dyn ProfileStore>,
    events: EventBus,
    sequences: DashMap<ConversationId, FollowUpSequence>,
    /// Re-arm suppressed until the stored instant.
    cooldowns: DashMap<ConversationId, Instant>,
    /// Conversations whose last outbound follow-up got no reply yet.
    unanswered: DashSet<ConversationId>,
    rng: Mutex<StdRng>,
}

/// A level the driver claimed and is about to send.
struct Fire {
    sequence_id: Uuid,
    level: u8,
    tier: EscalationTier,
    text: String,
    last: bool,
}

/// Schedules, fires and cancels follow-up sequences.
#[derive(Clone)]
pub struct PersuasionSequencer {
    inner: Arc<SequencerInner>,
}

impl fmt::Debug for PersuasionSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersuasionSequencer")
            .field("armed", &self.inner.sequences.len())
            .field("cooling_down", &self.inner.cooldowns.len())
            .finish()
    }
}

impl PersuasionSequencer {
    pub fn new(
        config: PersuasionConfig,
        templates: TemplateBook,
        transport: Arc<dyn MessageTransport>,
        store: Arc<dyn ProfileStore>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(SequencerInner {
                config,
                templates,
                transport,
                store,
                events,
                sequences: DashMap::new(),
                cooldowns: DashMap::new(),
                unanswered: DashSet::new(),
                rng: Mutex::new(StdRng::from_entropy()),
            }),
        }
    }

    /// Reseed template selection, for reproducible wording.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.inner.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &PersuasionConfig {
        &self.inner.config
    }

    /// Arm a fresh sequence, replacing any live one.
    pub fn arm(&self, id: &ConversationId, archetype: Archetype, engagement: f32) -> ArmOutcome {
        self.schedule(id, archetype, engagement, Utc::now(), Duration::ZERO, 0)
    }

    /// Resume a sequence that was started before a restart.
    ///
    /// Levels up to `attempts_fired` count as fired. Other levels whose
    /// offset from `started_at` has already passed are skipped.
    pub fn restore(
        &self,
        id: &ConversationId,
        archetype: Archetype,
        engagement: f32,
        started_at: DateTime<Utc>,
        attempts_fired: u8,
    ) -> ArmOutcome {
        let elapsed = (Utc::now() - started_at).to_std().unwrap_or(Duration::ZERO);
        self.schedule(id, archetype, engagement, started_at, elapsed, attempts_fired)
    }

    fn schedule(
        &self,
        id: &ConversationId,
        archetype: Archetype,
        engagement: f32,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        attempts_fired: u8,
    ) -> ArmOutcome {
        let inner = &self.inner;
        if let Some(remaining) = self.cooldown_remaining(id) {
            log::info!(
                "[{}] follow-up arm suppressed, cooling down for {}s",
                id,
                remaining.as_secs()
            );
            inner.events.emit(OrchestratorEvent::ArmSuppressed {
                conversation_id: id.clone(),
                remaining_secs: remaining.as_secs(),
            });
            return ArmOutcome::Suppressed {
                remaining_secs: remaining.as_secs(),
            };
        }

        let offsets = inner.config.level_offsets();
        let total = offsets.len().min(u8::MAX as usize) as u8;
        let max_tier = EscalationTier::cap_for_engagement(engagement, &inner.config);
        let now = Instant::now();
        let levels: Vec<ScheduledLevel> = offsets
            .iter()
            .take(total as usize)
            .enumerate()
            .map(|(index, offset)| {
                let level = index as u8 + 1;
                let status = if level <= attempts_fired {
                    LevelStatus::Fired
                } else if *offset < elapsed {
                    LevelStatus::Skipped
                } else {
                    LevelStatus::Pending
                };
                ScheduledLevel {
                    level,
                    tier: EscalationTier::for_level(level, total).min(max_tier),
                    offset_secs: offset.as_secs(),
                    status,
                    due_at: now + offset.saturating_sub(elapsed),
                }
            })
            .collect();

        let plan: Vec<(u8, Instant)> = levels
            .iter()
            .filter(|l| l.status == LevelStatus::Pending)
            .map(|l| (l.level, l.due_at))
            .collect();
        if plan.is_empty() {
            log::info!("[{}] follow-up sequence has no levels left to schedule", id);
            return ArmOutcome::Exhausted;
        }

        let sequence_id = Uuid::new_v4();
        let sequence = FollowUpSequence {
            sequence_id,
            conversation_id: id.clone(),
            archetype,
            max_tier,
            started_at,
            state: SequenceState::Armed,
            levels,
            driver: None,
        };

        // The driver is spawned while the entry is held so it can never
        // observe the map before its sequence is in place.
        let previous = match inner.sequences.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let old = std::mem::replace(slot, sequence);
                slot.driver = Some(self.spawn_driver(id.clone(), sequence_id, plan));
                Some(old)
            }
            Entry::Vacant(vacant) => {
                let mut slot = vacant.insert(sequence);
                slot.driver = Some(self.spawn_driver(id.clone(), sequence_id, plan));
                None
            }
        };

        let previous = previous.map(|mut old| {
            if let Some(driver) = old.driver.take() {
                driver.cancel();
            }
            if old.state == SequenceState::Armed {
                old.state = SequenceState::Cancelled;
            }
            old.snapshot()
        });

        log::info!(
            "[{}] follow-up sequence {} armed ({} archetype, max tier {})",
            id,
            sequence_id,
            archetype,
            max_tier
        );
        inner.events.emit(OrchestratorEvent::SequenceArmed {
            conversation_id: id.clone(),
            sequence_id,
            archetype,
            max_tier,
            superseded: previous.as_ref().map(|p| p.sequence_id),
        });

        match previous {
            Some(previous) => ArmOutcome::Superseded {
                sequence_id,
                max_tier,
                previous,
            },
            None => ArmOutcome::Armed {
                sequence_id,
                max_tier,
            },
        }
    }

    fn spawn_driver(&self, id: ConversationId, sequence_id: Uuid, plan: Vec<(u8, Instant)>) -> ScheduledTask {
        ScheduledTask::spawn(drive(Arc::downgrade(&self.inner), id, sequence_id, plan))
    }

    /// Cancel the live sequence. Idempotent; already-fired levels stay sent.
    pub fn cancel(&self, id: &ConversationId) -> Option<SequenceSnapshot> {
        let (_, mut sequence) = self
            .inner
            .sequences
            .remove_if(id, |_, s| s.state == SequenceState::Armed)?;
        sequence.state = SequenceState::Cancelled;
        if let Some(driver) = sequence.driver.take() {
            driver.cancel();
        }
        let snapshot = sequence.snapshot();
        log::info!(
            "[{}] follow-up sequence {} cancelled after {} level(s)",
            id,
            snapshot.sequence_id,
            snapshot.fired_levels
        );
        self.inner.events.emit(OrchestratorEvent::SequenceCancelled {
            conversation_id: id.clone(),
            sequence_id: snapshot.sequence_id,
            fired_levels: snapshot.fired_levels,
        });
        Some(snapshot)
    }

    /// Handle any inbound user message: cancel, then check for irritation.
    ///
    /// An irritated message always starts the re-arm cool-down. It also
    /// earns one apology when it answers follow-ups: a sequence was live,
    /// or a level went out and this is the first message since. The apology
    /// is sent on a detached task, so this never waits on the transport.
    pub fn on_user_message(&self, id: &ConversationId, text: &str) -> UserMessageOutcome {
        let cancelled = self.cancel(id);
        let answered_follow_up = self.inner.unanswered.remove(id).is_some();

        let Some(signal) = irritation::detect(text) else {
            return UserMessageOutcome {
                cancelled,
                irritation: None,
                apology_queued: false,
            };
        };

        log::info!(
            "[{}] irritated message ({:?}: {:?})",
            id,
            signal.category,
            signal.phrase
        );
        self.start_cooldown(id);

        let apology_queued = cancelled.is_some() || answered_follow_up;
        if apology_queued {
            self.send_apology(id);
        }

        UserMessageOutcome {
            cancelled,
            irritation: Some(signal),
            apology_queued,
        }
    }

    fn send_apology(&self, id: &ConversationId) {
        let apology = {
            let mut rng = self.inner.rng.lock();
            self.inner.templates.apology(&mut *rng)
        };
        let inner = Arc::clone(&self.inner);
        let id = id.clone();
        ScheduledTask::spawn(async move {
            match inner.transport.send(&id, &apology).await {
                Ok(()) => {
                    log::info!("[{}] apology sent", id);
                    inner.events.emit(OrchestratorEvent::ApologySent {
                        conversation_id: id.clone(),
                    });
                }
                Err(e) => log::warn!("[{}] apology delivery failed: {}", id, e),
            }
        })
        .detach();
    }

    fn start_cooldown(&self, id: &ConversationId) {
        let cooldown = self.inner.config.irritation_cooldown();
        if !cooldown.is_zero() {
            self.inner.cooldowns.insert(id.clone(), Instant::now() + cooldown);
        }
    }

    /// Time left before `id` may be armed again.
    pub fn cooldown_remaining(&self, id: &ConversationId) -> Option<Duration> {
        let now = Instant::now();
        let until = *self.inner.cooldowns.get(id)?;
        if until > now {
            return Some(until - now);
        }
        self.inner.cooldowns.remove_if(id, |_, until| *until <= now);
        None
    }

    pub fn snapshot(&self, id: &ConversationId) -> Option<SequenceSnapshot> {
        self.inner.sequences.get(id).map(|s| s.snapshot())
    }

    pub fn is_armed(&self, id: &ConversationId) -> bool {
        self.inner
            .sequences
            .get(id)
            .map_or(false, |s| s.state == SequenceState::Armed)
    }

    pub fn armed_count(&self) -> usize {
        self.inner.sequences.len()
    }

    /// Drop every sequence, aborting their drivers.
    pub fn clear(&self) {
        self.inner.sequences.clear();
        self.inner.unanswered.clear();
    }
}

impl SequencerInner {
    /// Claim `level` of `sequence_id` if it is still the live sequence.
    fn begin_fire(&self, id: &ConversationId, sequence_id: Uuid, level: u8) -> Option<Fire> {
        let mut entry = self.sequences.get_mut(id)?;
        let sequence = entry.value_mut();
        if sequence.sequence_id != sequence_id || sequence.state != SequenceState::Armed {
            return None;
        }
        let last_level = sequence.levels.last().map(|l| l.level)?;
        let archetype = sequence.archetype;

        let slot = sequence.levels.iter_mut().find(|l| l.level == level)?;
        if slot.status != LevelStatus::Pending {
            return None;
        }
        slot.status = LevelStatus::Fired;
        let tier = slot.tier;

        let last = level == last_level;
        if last {
            sequence.state = SequenceState::Completed;
        }
        let text = self.templates.select(archetype, tier, &mut *self.rng.lock());
        Some(Fire {
            sequence_id,
            level,
            tier,
            text,
            last,
        })
    }

    async fn dispatch(self: Arc<Self>, id: ConversationId, fire: Fire) {
        match self.transport.send(&id, &fire.text).await {
            Ok(()) => log::info!("[{}] follow-up L{} ({}) sent", id, fire.level, fire.tier),
            Err(e) => log::warn!("[{}] follow-up L{} delivery failed: {}", id, fire.level, e),
        }
        self.unanswered.insert(id.clone());
        if let Err(e) = self.store.record_follow_up(&id, fire.level).await {
            log::warn!("[{}] failed to record follow-up L{}: {}", id, fire.level, e);
        }
        self.events.emit(OrchestratorEvent::FollowUpFired {
            conversation_id: id.clone(),
            sequence_id: fire.sequence_id,
            level: fire.level,
            tier: fire.tier,
        });

        if fire.last {
            if let Err(e) = self.store.mark_abandoned(&id).await {
                log::warn!("[{}] failed to mark conversation abandoned: {}", id, e);
            }
            log::info!("[{}] follow-up sequence exhausted, conversation abandoned", id);
            self.events.emit(OrchestratorEvent::SequenceCompleted {
                conversation_id: id.clone(),
                sequence_id: fire.sequence_id,
            });
            self.sequences
                .remove_if(&id, |_, s| s.sequence_id == fire.sequence_id);
        }
    }
}

async fn drive(inner: Weak<SequencerInner>, id: ConversationId, sequence_id: Uuid, plan: Vec<(u8, Instant)>) {
    for (level, due_at) in plan {
        tokio::time::sleep_until(due_at).await;
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let Some(fire) = strong.begin_fire(&id, sequence_id, level) else {
            return;
        };
        let last = fire.last;
        let send = tokio::spawn(strong.dispatch(id.clone(), fire));
        // Levels stay strictly ordered: the next sleep starts after this send.
        if send.await.is_err() || last {
            return;
        }
    }
}
