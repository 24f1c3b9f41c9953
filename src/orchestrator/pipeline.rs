//! The per-turn pipeline.
//!
//! ```text
//! admit ─► load profile ─► classify ─► generate (+ ack) ─► read pause
//!       ─► typing on ─► typing pause ─► send ─► commit
//! ```
//!
//! A turn is all-or-nothing. Whatever stage fails, the admission token is
//! released and nothing is committed: no activity mark, no profile update,
//! no follow-up sequence.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use tokio::time::Instant;

use crate::activity::ActivityTracker;
use crate::config::OrchestratorConfig;
use crate::error::TurnError;
use crate::events::{EventBus, OrchestratorEvent};
use crate::interfaces::Collaborators;
use crate::pacing::{AdaptiveContext, DelayModel};
use crate::persuasion::{ArmOutcome, PersuasionSequencer};
use crate::turns::AdmissionGuard;
use crate::types::{ConversationId, ConversationProfile, LogicalTurn, TurnLabels};

/// Everything a running turn needs, shared by all turn tasks.
pub(crate) struct TurnContext {
    pub config: OrchestratorConfig,
    pub collaborators: Collaborators,
    pub admission: AdmissionGuard,
    pub activity: Arc<ActivityTracker>,
    pub delay: DelayModel,
    pub sequencer: PersuasionSequencer,
    pub events: EventBus,
    /// Arrival time of the newest fragment seen per conversation.
    pub last_inbound: DashMap<ConversationId, Instant>,
    pub rng: Mutex<StdRng>,
}

/// How a logical turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    /// Another turn for the conversation was in flight.
    Dropped,
    Abandoned { stage: &'static str },
    Delivered {
        /// Artificial pause applied before sending.
        delay: Duration,
        armed: Option<ArmOutcome>,
    },
}

pub(crate) async fn run_turn(ctx: Arc<TurnContext>, turn: LogicalTurn) -> TurnOutcome {
    let id = turn.conversation_id.clone();
    let Some(_token) = ctx.admission.try_admit(&id) else {
        log::info!("[{}] turn dropped, another turn is in flight", id);
        ctx.events.emit(OrchestratorEvent::TurnDropped { conversation_id: id });
        return TurnOutcome::Dropped;
    };

    match process(&ctx, &turn).await {
        Ok(outcome) => outcome,
        Err(e) => {
            log::warn!("[{}] turn abandoned at {} stage: {}", id, e.stage(), e);
            ctx.events.emit(OrchestratorEvent::TurnAbandoned {
                conversation_id: id,
                stage: e.stage(),
                error: e.to_string(),
            });
            TurnOutcome::Abandoned { stage: e.stage() }
        }
    }
}

async fn process(ctx: &TurnContext, turn: &LogicalTurn) -> Result<TurnOutcome, TurnError> {
    let id = &turn.conversation_id;
    let started = Instant::now();
    let transport = &ctx.collaborators.transport;
    let reply_latency = ctx.activity.time_since_last_response(id);

    if let Err(e) = transport.mark_read(id).await {
        log::debug!("[{}] read receipt failed: {}", id, e);
    }

    let profile = ctx
        .collaborators
        .store
        .load_profile(id)
        .await
        .map_err(TurnError::Profile)?;
    let labels = ctx
        .collaborators
        .classifier
        .classify(turn, &profile)
        .await
        .map_err(TurnError::Classification)?;

    let reply = generate_with_ack(ctx, turn, &labels, &profile).await?;
    let reply = reply.trim();
    if reply.is_empty() {
        return Err(TurnError::EmptyReply);
    }
    let processing = started.elapsed();

    let context = AdaptiveContext::now(
        ctx.config.pacing.utc_offset_minutes,
        reply_latency,
        labels.urgency,
    );
    let plan = {
        let mut rng = ctx.rng.lock();
        ctx.delay.plan(&turn.text, reply, &context, &mut *rng)
    };
    // Time spent classifying and generating already looked like typing.
    let typing = plan.typing.saturating_sub(processing);
    log::debug!(
        "[{}] pacing: read {:?}, type {:?} (planned {:?}, processing {:?})",
        id,
        plan.reading,
        typing,
        plan.typing,
        processing
    );

    tokio::time::sleep(plan.reading).await;
    if let Err(e) = transport.set_typing(id, true).await {
        log::debug!("[{}] typing indicator failed: {}", id, e);
    }
    tokio::time::sleep(typing).await;

    let sent = transport.send(id, reply).await;
    if let Err(e) = transport.set_typing(id, false).await {
        log::debug!("[{}] typing indicator failed: {}", id, e);
    }
    sent.map_err(TurnError::Delivery)?;

    commit(ctx, turn, &labels, plan.reading + typing).await
}

/// Generate the reply. When generation is slow and nobody has heard from us
/// recently, send the configured "I'm here" acknowledgement once.
async fn generate_with_ack(
    ctx: &TurnContext,
    turn: &LogicalTurn,
    labels: &TurnLabels,
    profile: &ConversationProfile,
) -> Result<String, TurnError> {
    let id = &turn.conversation_id;
    let mut generation = ctx.collaborators.generator.generate(turn, labels, profile);

    let Some(ack) = ctx.config.acknowledgement.text.as_deref() else {
        return generation.await.map_err(TurnError::Generation);
    };
    let ack_after = Duration::from_millis(ctx.config.acknowledgement.after_ms);

    tokio::select! {
        result = &mut generation => return result.map_err(TurnError::Generation),
        _ = tokio::time::sleep(ack_after) => {}
    }

    if ctx.activity.is_active(id) {
        log::debug!("[{}] slow generation, conversation active, no acknowledgement", id);
    } else {
        match ctx.collaborators.transport.send(id, ack).await {
            Ok(()) => {
                log::info!("[{}] acknowledgement sent while generating", id);
                ctx.events.emit(OrchestratorEvent::AcknowledgementSent {
                    conversation_id: id.clone(),
                });
            }
            Err(e) => log::warn!("[{}] acknowledgement delivery failed: {}", id, e),
        }
    }

    generation.await.map_err(TurnError::Generation)
}

async fn commit(
    ctx: &TurnContext,
    turn: &LogicalTurn,
    labels: &TurnLabels,
    delay: Duration,
) -> Result<TurnOutcome, TurnError> {
    let id = &turn.conversation_id;
    ctx.activity.mark_active(id);
    // The reply is already out; a store failure must not undo the turn.
    if let Err(e) = ctx.collaborators.store.record_turn(id, labels).await {
        log::warn!("[{}] failed to record turn: {}", id, e);
    }
    log::info!(
        "[{}] response sent after {}ms ({} fragment(s))",
        id,
        delay.as_millis(),
        turn.fragment_count
    );
    ctx.events.emit(OrchestratorEvent::ResponseSent {
        conversation_id: id.clone(),
        delay_ms: delay.as_millis() as u64,
    });

    let answered_everything = ctx
        .last_inbound
        .remove_if(id, |_, at| *at <= turn.last_arrived_at)
        .is_some()
        || !ctx.last_inbound.contains_key(id);
    let armed = if !labels.follow_up_eligible {
        None
    } else if !answered_everything {
        log::debug!("[{}] newer message arrived during the turn, follow-up not armed", id);
        None
    } else {
        Some(ctx.sequencer.arm(id, labels.archetype, labels.engagement))
    };
    Ok(TurnOutcome::Delivered { delay, armed })
}
