//! # Orchestrator
//!
//! Composition root. Wires the turn aggregator, admission guard, delay
//! model, activity tracker and persuasion sequencer to the external
//! collaborators.
//!
//! ## Flow
//!
//! ```text
//! on_fragment(id, fragment)
//!   │ buffer, then sequencer.on_user_message (cancels follow-ups)
//!   ▼
//! TurnAggregator ──(quiescence)──► LogicalTurn ──► dispatcher
//!                                                    │ one task per turn
//!                                                    ▼
//!                                              pipeline::run_turn
//! ```
//!
//! Background work (the dispatcher, the activity sweeper and follow-up
//! drivers) runs on the tokio runtime that called [`Orchestrator::start`].
//! Turn tasks are tracked so [`Orchestrator::shutdown`] can wait for them.

mod pipeline;

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinSet;

use crate::activity::ActivityTracker;
use crate::config::OrchestratorConfig;
use crate::events::{EventBus, OrchestratorEvent};
use crate::interfaces::Collaborators;
use crate::pacing::DelayModel;
use crate::persuasion::{ArmOutcome, PersuasionSequencer, SequenceSnapshot, TemplateBook, UserMessageOutcome};
use crate::scheduling::ScheduledTask;
use crate::turns::{AdmissionGuard, TurnAggregator};
use crate::types::{Archetype, ConversationId, Fragment, LogicalTurn};

use pipeline::TurnContext;
pub use pipeline::TurnOutcome;

/// Optional knobs for [`Orchestrator::start_with`].
#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    pub templates: TemplateBook,
    /// Seed for pacing jitter and template selection.
    pub seed: Option<u64>,
}

/// Point-in-time view of one conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationStatus {
    pub conversation_id: ConversationId,
    pub active: bool,
    pub turn_in_flight: bool,
    pub pending_fragments: usize,
    pub follow_up: Option<SequenceSnapshot>,
    pub cooldown_remaining_secs: Option<u64>,
}

/// The running orchestrator.
pub struct Orchestrator {
    ctx: Arc<TurnContext>,
    aggregator: TurnAggregator,
    stop: Arc<Notify>,
    /// Dispatcher first, then the activity sweeper.
    tasks: Mutex<Vec<ScheduledTask>>,
    in_flight: Arc<Mutex<JoinSet<TurnOutcome>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("turns_in_flight", &self.ctx.admission.held_count())
            .field("sequencer", &self.ctx.sequencer)
            .finish()
    }
}

impl Orchestrator {
    /// Start with the built-in templates and an entropy-seeded RNG.
    pub fn start(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        Self::start_with(config, collaborators, OrchestratorOptions::default())
    }

    pub fn start_with(
        config: OrchestratorConfig,
        collaborators: Collaborators,
        options: OrchestratorOptions,
    ) -> Self {
        let rng = || match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let events = EventBus::new(config.event_capacity());
        let activity = Arc::new(ActivityTracker::from_config(&config.activity));
        let mut sequencer = PersuasionSequencer::new(
            config.persuasion.clone(),
            options.templates.clone(),
            Arc::clone(&collaborators.transport),
            Arc::clone(&collaborators.store),
            events.clone(),
        );
        if let Some(seed) = options.seed {
            sequencer = sequencer.with_seed(seed);
        }

        let (sink, turns) = mpsc::unbounded_channel();
        let aggregator = TurnAggregator::new(config.aggregator.clone(), sink);
        let sweep_interval = config.activity.sweep_interval();

        let ctx = Arc::new(TurnContext {
            delay: DelayModel::new(config.pacing.clone()),
            config,
            collaborators,
            admission: AdmissionGuard::new(),
            activity: Arc::clone(&activity),
            sequencer,
            events,
            last_inbound: DashMap::new(),
            rng: Mutex::new(rng()),
        });

        let stop = Arc::new(Notify::new());
        let in_flight = Arc::new(Mutex::new(JoinSet::new()));
        let dispatcher = ScheduledTask::spawn(dispatch_loop(
            Arc::downgrade(&ctx),
            turns,
            Arc::clone(&in_flight),
            Arc::clone(&stop),
        ));
        let sweeper = activity.spawn_sweeper(sweep_interval);
        log::info!("Orchestrator started");

        Self {
            ctx,
            aggregator,
            stop,
            tasks: Mutex::new(vec![dispatcher, sweeper]),
            in_flight,
        }
    }

    /// Inbound path for one raw message piece.
    ///
    /// The fragment is buffered, then any live follow-up sequence is
    /// cancelled. Nothing here waits on a collaborator.
    pub fn on_fragment(&self, id: &ConversationId, fragment: Fragment) -> UserMessageOutcome {
        let text = fragment.text.clone();
        let arrived_at = fragment.arrived_at;
        self.ctx
            .last_inbound
            .entry(id.clone())
            .and_modify(|at| *at = (*at).max(arrived_at))
            .or_insert(arrived_at);
        self.aggregator.on_fragment(id, fragment);
        self.ctx.sequencer.on_user_message(id, &text)
    }

    /// Convenience for a text fragment arriving now.
    pub fn on_text(&self, id: &ConversationId, text: impl Into<String>) -> UserMessageOutcome {
        self.on_fragment(id, Fragment::text(text))
    }

    /// Run the turn pipeline inline, bypassing the aggregator.
    pub async fn handle_turn(&self, turn: LogicalTurn) -> TurnOutcome {
        pipeline::run_turn(Arc::clone(&self.ctx), turn).await
    }

    /// Arm a follow-up sequence directly.
    pub fn arm_follow_up(&self, id: &ConversationId, archetype: Archetype, engagement: f32) -> ArmOutcome {
        self.ctx.sequencer.arm(id, archetype, engagement)
    }

    pub fn cancel_follow_up(&self, id: &ConversationId) -> Option<SequenceSnapshot> {
        self.ctx.sequencer.cancel(id)
    }

    pub fn status(&self, id: &ConversationId) -> ConversationStatus {
        ConversationStatus {
            conversation_id: id.clone(),
            active: self.ctx.activity.is_active(id),
            turn_in_flight: self.ctx.admission.is_held(id),
            pending_fragments: self.aggregator.pending_count(id),
            follow_up: self.ctx.sequencer.snapshot(id),
            cooldown_remaining_secs: self.ctx.sequencer.cooldown_remaining(id).map(|d| d.as_secs()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.ctx.events.subscribe()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.ctx.config
    }

    pub fn sequencer(&self) -> &PersuasionSequencer {
        &self.ctx.sequencer
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.ctx.activity
    }

    pub fn admission(&self) -> &AdmissionGuard {
        &self.ctx.admission
    }

    /// Stop background work and wait for turns to finish.
    ///
    /// Buffered fragments are flushed and dispatched as turns one last
    /// time; follow-up sequences and the activity sweeper are dropped.
    /// Turns still running after the configured grace period are aborted.
    /// Returns the number of turns flushed.
    pub async fn shutdown(&self) -> usize {
        let flushed = self.aggregator.flush_all();
        self.stop.notify_one();
        self.ctx.sequencer.clear();

        let mut tasks = std::mem::take(&mut *self.tasks.lock()).into_iter();
        let dispatcher = tasks.next();
        for task in tasks {
            task.cancel();
        }

        let grace = self.ctx.config.shutdown_grace();
        let in_flight = Arc::clone(&self.in_flight);
        let drained = tokio::time::timeout(grace, async move {
            // The dispatcher drains the channel before it exits.
            if let Some(dispatcher) = dispatcher {
                dispatcher.finished().await;
            }
            let mut turns = std::mem::take(&mut *in_flight.lock());
            while turns.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => log::info!("Orchestrator shut down ({} pending turn(s) flushed)", flushed),
            Err(_) => log::warn!(
                "Orchestrator shut down after {:?} grace period, unfinished turns aborted",
                grace
            ),
        }
        flushed
    }
}

async fn dispatch_loop(
    ctx: Weak<TurnContext>,
    mut turns: UnboundedReceiver<LogicalTurn>,
    in_flight: Arc<Mutex<JoinSet<TurnOutcome>>>,
    stop: Arc<Notify>,
) {
    loop {
        tokio::select! {
            turn = turns.recv() => match turn {
                Some(turn) => {
                    if !dispatch(&ctx, &in_flight, turn) {
                        break;
                    }
                }
                None => break,
            },
            _ = stop.notified() => {
                while let Ok(turn) = turns.try_recv() {
                    dispatch(&ctx, &in_flight, turn);
                }
                break;
            }
        }
    }
    log::debug!("Turn dispatcher stopped");
}

fn dispatch(ctx: &Weak<TurnContext>, in_flight: &Mutex<JoinSet<TurnOutcome>>, turn: LogicalTurn) -> bool {
    let Some(ctx) = ctx.upgrade() else {
        return false;
    };
    ctx.events.emit(OrchestratorEvent::TurnEmitted {
        conversation_id: turn.conversation_id.clone(),
        text: turn.text.clone(),
        fragment_count: turn.fragment_count,
        discarded: turn.discarded,
    });
    let mut in_flight = in_flight.lock();
    // Reap finished turns so the set only holds running ones.
    while in_flight.try_join_next().is_some() {}
    in_flight.spawn(pipeline::run_turn(ctx, turn));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::testing::{Outbound, RecordingTransport, ScriptedGenerator, StaticClassifier};
    use crate::interfaces::InMemoryProfileStore;
    use crate::types::{FragmentKind, TurnLabels};
    use std::time::Duration;
    use tokio::time::Instant;

    struct Harness {
        orchestrator: Orchestrator,
        transport: Arc<RecordingTransport>,
        generator: Arc<ScriptedGenerator>,
        store: Arc<InMemoryProfileStore>,
        events: broadcast::Receiver<OrchestratorEvent>,
    }

    fn harness_with(config: OrchestratorConfig, generator: ScriptedGenerator, eligible: bool) -> Harness {
        let transport = Arc::new(RecordingTransport::new());
        let generator = Arc::new(generator);
        let store = Arc::new(InMemoryProfileStore::new());
        let classifier = StaticClassifier {
            labels: TurnLabels {
                follow_up_eligible: eligible,
                ..TurnLabels::default()
            },
        };
        let collaborators = Collaborators {
            transport: transport.clone(),
            classifier: Arc::new(classifier),
            generator: generator.clone(),
            store: store.clone(),
        };
        let orchestrator = Orchestrator::start_with(
            config,
            collaborators,
            OrchestratorOptions {
                seed: Some(42),
                ..OrchestratorOptions::default()
            },
        );
        let events = orchestrator.subscribe();
        Harness {
            orchestrator,
            transport,
            generator,
            store,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(OrchestratorConfig::default(), ScriptedGenerator::default(), false)
    }

    fn drain(events: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_fragments_produce_one_reply() {
        let h = harness();
        let id = ConversationId::from("c");
        h.orchestrator.on_text(&id, "quero");
        sleep_ms(1_000).await;
        h.orchestrator.on_text(&id, "agendar");
        sleep_ms(1_000).await;
        h.orchestrator.on_text(&id, "banho");
        sleep_ms(20_000).await;

        assert_eq!(*h.generator.seen.lock(), vec!["quero agendar banho".to_string()]);
        assert_eq!(h.transport.texts("c"), vec!["re: quero agendar banho".to_string()]);
        assert!(h.orchestrator.status(&id).active);
        assert_eq!(h.store.get(&id).unwrap().turns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_messages_get_separate_replies() {
        let h = harness();
        let id = ConversationId::from("c");
        h.orchestrator.on_text(&id, "oi");
        sleep_ms(30_000).await;
        h.orchestrator.on_text(&id, "tudo bem?");
        sleep_ms(30_000).await;

        assert_eq!(h.generator.calls(), 2);
        assert_eq!(
            h.transport.texts("c"),
            vec!["re: oi".to_string(), "re: tudo bem?".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_during_in_flight_turn_is_dropped() {
        let mut h = harness_with(
            OrchestratorConfig::default(),
            ScriptedGenerator::with_latency(Duration::from_secs(10)),
            false,
        );
        let id = ConversationId::from("c");
        h.orchestrator.on_text(&id, "a");
        // First turn flushes at 3 s and generates until 13 s.
        sleep_ms(5_000).await;
        assert!(h.orchestrator.admission().is_held(&id));
        h.orchestrator.on_text(&id, "b");
        sleep_ms(30_000).await;

        assert_eq!(h.generator.calls(), 1);
        assert_eq!(h.transport.texts("c"), vec!["re: a".to_string()]);
        assert!(drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, OrchestratorEvent::TurnDropped { .. })));
        assert!(!h.orchestrator.admission().is_held(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_failure_commits_nothing() {
        let mut h = harness_with(OrchestratorConfig::default(), ScriptedGenerator::failing(), true);
        let id = ConversationId::from("c");
        h.orchestrator.on_text(&id, "quero agendar");
        sleep_ms(20_000).await;

        assert!(h.transport.texts("c").is_empty());
        let status = h.orchestrator.status(&id);
        assert!(!status.active);
        assert!(!status.turn_in_flight);
        assert!(status.follow_up.is_none());
        assert!(h.store.get(&id).is_none());

        let abandoned = drain(&mut h.events).into_iter().find_map(|e| match e {
            OrchestratorEvent::TurnAbandoned { stage, .. } => Some(stage),
            _ => None,
        });
        assert_eq!(abandoned, Some("generate"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failure_commits_nothing() {
        let h = harness_with(OrchestratorConfig::default(), ScriptedGenerator::default(), true);
        h.transport.fail_sends(true);
        let id = ConversationId::from("c");
        h.orchestrator.on_text(&id, "quero agendar");
        sleep_ms(20_000).await;

        let status = h.orchestrator.status(&id);
        assert!(!status.active);
        assert!(!status.turn_in_flight);
        assert!(status.follow_up.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eligible_turn_arms_follow_up_and_reply_cancels_it() {
        let h = harness_with(OrchestratorConfig::default(), ScriptedGenerator::default(), true);
        let id = ConversationId::from("c");
        h.orchestrator.on_text(&id, "quanto custa?");
        sleep_ms(20_000).await;
        assert!(h.orchestrator.sequencer().is_armed(&id));

        // First follow-up 90 s after the reply.
        sleep_ms(90_000).await;
        assert_eq!(h.transport.texts("c").len(), 2);

        let outcome = h.orchestrator.on_text(&id, "ok, vou ver");
        assert_eq!(outcome.cancelled.map(|s| s.fired_levels), Some(1));
        assert!(!h.orchestrator.sequencer().is_armed(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ineligible_turn_does_not_arm() {
        let h = harness();
        let id = ConversationId::from("c");
        h.orchestrator.on_text(&id, "obrigado");
        sleep_ms(20_000).await;
        assert_eq!(h.transport.texts("c").len(), 1);
        assert!(!h.orchestrator.sequencer().is_armed(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_is_paced_with_typing_indicator() {
        let h = harness();
        let id = ConversationId::from("c");
        let start = Instant::now();
        h.orchestrator.on_text(&id, "hello");
        sleep_ms(20_000).await;

        let log = h.transport.log();
        let kinds: Vec<Outbound> = log.iter().map(|s| s.what.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                Outbound::Read,
                Outbound::Typing(true),
                Outbound::Text("re: hello".to_string()),
                Outbound::Typing(false),
            ]
        );
        // Flushed at 3 s, then a short-text pause of 1.5 to 3 s (timers
        // round up to the millisecond).
        let sent_after = log[2].at.duration_since(start);
        assert!(sent_after >= Duration::from_millis(4_500), "{:?}", sent_after);
        assert!(sent_after <= Duration::from_millis(6_010), "{:?}", sent_after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_generation_sends_one_acknowledgement_when_idle() {
        let mut config = OrchestratorConfig::default();
        config.acknowledgement.text = Some("Só um instante...".to_string());
        let h = harness_with(config, ScriptedGenerator::with_latency(Duration::from_secs(6)), false);
        let id = ConversationId::from("c");

        h.orchestrator.on_text(&id, "a");
        sleep_ms(30_000).await;
        // Still inside the activity window: no second acknowledgement.
        h.orchestrator.on_text(&id, "b");
        sleep_ms(30_000).await;

        assert_eq!(
            h.transport.texts("c"),
            vec![
                "Só um instante...".to_string(),
                "re: a".to_string(),
                "re: b".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_fragment_is_not_debounced() {
        let mut h = harness();
        let id = ConversationId::from("c");
        h.orchestrator
            .on_fragment(&id, Fragment::text("[audio]").with_kind(FragmentKind::Voice));
        sleep_ms(10).await;

        let emitted = drain(&mut h.events).into_iter().any(|e| {
            matches!(e, OrchestratorEvent::TurnEmitted { fragment_count: 1, .. })
        });
        assert!(emitted);
        assert_eq!(h.orchestrator.status(&id).pending_fragments, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending_fragments() {
        let h = harness();
        let id = ConversationId::from("c");
        h.orchestrator.on_text(&id, "oi");
        assert_eq!(h.orchestrator.status(&id).pending_fragments, 1);

        // The flushed turn is delivered before shutdown returns.
        assert_eq!(h.orchestrator.shutdown().await, 1);
        assert_eq!(h.transport.texts("c"), vec!["re: oi".to_string()]);
        assert!(!h.orchestrator.admission().is_held(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_turns_past_the_grace_period() {
        let mut config = OrchestratorConfig::default();
        config.shutdown_grace_secs = 5;
        let h = harness_with(config, ScriptedGenerator::with_latency(Duration::from_secs(60)), false);
        let id = ConversationId::from("c");
        h.orchestrator.on_text(&id, "oi");

        let started = Instant::now();
        assert_eq!(h.orchestrator.shutdown().await, 1);
        assert!(started.elapsed() < Duration::from_secs(6));

        // Aborted turns release their admission token once the runtime drops them.
        sleep_ms(120_000).await;
        assert!(h.transport.texts("c").is_empty());
        assert!(!h.orchestrator.admission().is_held(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_during_turn_blocks_follow_up_arm() {
        let h = harness_with(
            OrchestratorConfig::default(),
            ScriptedGenerator::with_latency(Duration::from_secs(10)),
            true,
        );
        let id = ConversationId::from("c");
        h.orchestrator.on_text(&id, "quanto custa?");
        // The first turn is generating when the second message lands.
        sleep_ms(5_000).await;
        h.orchestrator.on_text(&id, "e pra gato?");
        sleep_ms(30_000).await;

        assert_eq!(h.transport.texts("c"), vec!["re: quanto custa?".to_string()]);
        assert!(!h.orchestrator.sequencer().is_armed(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_transport_does_not_block_inbound_path() {
        let h = harness();
        let id = ConversationId::from("c");
        h.orchestrator.arm_follow_up(&id, Archetype::Unknown, 0.5);
        h.transport.stall_sends(true);

        let outcome = h.orchestrator.on_text(&id, "para de me mandar mensagem");
        assert!(outcome.apology_queued);
        assert!(outcome.cancelled.is_some());
        assert_eq!(h.orchestrator.status(&id).pending_fragments, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_turn_reports_outcome() {
        let h = harness_with(OrchestratorConfig::default(), ScriptedGenerator::default(), true);
        let turn = LogicalTurn::single("c".into(), Fragment::text("quero agendar"));
        match h.orchestrator.handle_turn(turn).await {
            TurnOutcome::Delivered { delay, armed } => {
                assert!(delay >= Duration::from_millis(800));
                assert!(armed.map_or(false, |a| a.is_armed()));
            }
            other => panic!("expected delivery, got {:?}", other),
        }
    }
}
