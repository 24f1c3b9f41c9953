//! Turn aggregator: coalesces rapidly-arriving fragments into one turn.
//!
//! Each conversation has at most one [`PendingTurn`]. Every text fragment
//! restarts its quiescence timer; when the timer finally fires the buffer
//! is removed from the map and converted into a [`LogicalTurn`], which is
//! pushed into the sink channel.
//!
//! Timer callbacks carry the generation they were scheduled for and only
//! flush if the pending turn still has that generation, so a timer that
//! loses the race with a newer fragment does nothing even if its abort
//! arrived too late.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::config::AggregatorConfig;
use crate::scheduling::ScheduledTask;
use crate::types::{ConversationId, Fragment, LogicalTurn};

/// Fragments buffered for one conversation while waiting for quiescence.
#[derive(Debug)]
pub struct PendingTurn {
    pub fragments: Vec<Fragment>,
    generation: u64,
    opened_at: Instant,
    timer: Option<ScheduledTask>,
}

/// Per-conversation debounce buffer.
#[derive(Clone)]
pub struct TurnAggregator {
    inner: Arc<AggregatorInner>,
}

struct AggregatorInner {
    config: AggregatorConfig,
    pending: DashMap<ConversationId, PendingTurn>,
    sink: UnboundedSender<LogicalTurn>,
    generations: AtomicU64,
}

impl TurnAggregator {
    pub fn new(config: AggregatorConfig, sink: UnboundedSender<LogicalTurn>) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                config,
                pending: DashMap::new(),
                sink,
                generations: AtomicU64::new(1),
            }),
        }
    }

    /// Accept one inbound fragment.
    ///
    /// Voice and media fragments are emitted immediately as single-fragment
    /// turns. Text fragments are buffered and the quiescence timer is
    /// (re)started; reaching `max_fragments` flushes right away.
    pub fn on_fragment(&self, id: &ConversationId, fragment: Fragment) {
        if fragment.kind.bypasses_aggregation() {
            log::debug!("[{}] {:?} fragment bypasses aggregation", id, fragment.kind);
            self.inner.emit(LogicalTurn::single(id.clone(), fragment));
            return;
        }

        let inner = &self.inner;
        let generation = inner.generations.fetch_add(1, Ordering::Relaxed);

        match inner.pending.entry(id.clone()) {
            Entry::Vacant(vacant) => {
                if inner.config.max_fragments <= 1 {
                    inner.emit(build_turn(id, vec![fragment], inner.config.max_interval()));
                    return;
                }
                let opened_at = Instant::now();
                let timer = self.schedule_flush(id, generation, opened_at);
                vacant.insert(PendingTurn {
                    fragments: vec![fragment],
                    generation,
                    opened_at,
                    timer: Some(timer),
                });
            }
            Entry::Occupied(mut occupied) => {
                let pending = occupied.get_mut();
                pending.fragments.push(fragment);

                if pending.fragments.len() >= inner.config.max_fragments {
                    let pending = occupied.remove();
                    if let Some(timer) = pending.timer {
                        timer.cancel();
                    }
                    log::debug!(
                        "[{}] fragment cap ({}) reached, flushing early",
                        id,
                        inner.config.max_fragments
                    );
                    inner.emit(build_turn(id, pending.fragments, inner.config.max_interval()));
                    return;
                }

                pending.generation = generation;
                let opened_at = pending.opened_at;
                // Replacing the handle aborts the previous timer.
                pending.timer = Some(self.schedule_flush(id, generation, opened_at));
            }
        }
    }

    /// Flush the pending turn for `id` immediately, if there is one.
    pub fn flush_now(&self, id: &ConversationId) -> bool {
        match self.inner.pending.remove(id) {
            Some((_, pending)) => {
                if let Some(timer) = pending.timer {
                    timer.cancel();
                }
                self.inner.emit(build_turn(
                    id,
                    pending.fragments,
                    self.inner.config.max_interval(),
                ));
                true
            }
            None => false,
        }
    }

    /// Flush every pending turn (used on shutdown).
    pub fn flush_all(&self) -> usize {
        let ids: Vec<ConversationId> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter().filter(|id| self.flush_now(id)).count()
    }

    pub fn has_pending(&self, id: &ConversationId) -> bool {
        self.inner.pending.contains_key(id)
    }

    /// Number of fragments buffered for `id`.
    pub fn pending_count(&self, id: &ConversationId) -> usize {
        self.inner
            .pending
            .get(id)
            .map_or(0, |pending| pending.fragments.len())
    }

    fn schedule_flush(
        &self,
        id: &ConversationId,
        generation: u64,
        opened_at: Instant,
    ) -> ScheduledTask {
        let config = &self.inner.config;
        let deadline = (Instant::now() + config.window()).min(opened_at + config.max_wait());
        let inner: Weak<AggregatorInner> = Arc::downgrade(&self.inner);
        let id = id.clone();
        ScheduledTask::at(deadline, async move {
            if let Some(inner) = inner.upgrade() {
                inner.flush_if_current(&id, generation);
            }
        })
    }
}

impl AggregatorInner {
    fn flush_if_current(&self, id: &ConversationId, generation: u64) {
        let removed = self
            .pending
            .remove_if(id, |_, pending| pending.generation == generation);
        if let Some((_, pending)) = removed {
            // This code runs inside that timer; keep it alive.
            if let Some(timer) = pending.timer {
                timer.detach();
            }
            self.emit(build_turn(id, pending.fragments, self.config.max_interval()));
        }
    }

    fn emit(&self, turn: LogicalTurn) {
        log::debug!(
            "[{}] emitting turn ({} fragment(s), {} discarded)",
            turn.conversation_id,
            turn.fragment_count,
            turn.discarded
        );
        if self.sink.send(turn).is_err() {
            log::warn!("Turn sink closed; dropping logical turn");
        }
    }
}

/// Convert buffered fragments into one logical turn.
///
/// Sequential fragments (every gap ≤ `max_interval`) are joined with single
/// spaces in arrival order. Otherwise the earlier fragments are stale and
/// only the last one becomes the turn.
pub fn build_turn(
    id: &ConversationId,
    mut fragments: Vec<Fragment>,
    max_interval: Duration,
) -> LogicalTurn {
    fragments.sort_by_key(|f| f.arrived_at);

    let sequential = fragments
        .windows(2)
        .all(|pair| pair[1].arrived_at.saturating_duration_since(pair[0].arrived_at) <= max_interval);

    let first_arrived_at = fragments.first().map(|f| f.arrived_at);
    let count = fragments.len();

    if sequential && count > 1 {
        let text = fragments
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let last = &fragments[count - 1];
        return LogicalTurn {
            conversation_id: id.clone(),
            text,
            kind: last.kind,
            fragment_count: count,
            discarded: 0,
            first_arrived_at: first_arrived_at.unwrap_or(last.arrived_at),
            last_arrived_at: last.arrived_at,
        };
    }

    let discarded = count.saturating_sub(1);
    if discarded > 0 {
        log::debug!("[{}] discarding {} stale fragment(s)", id, discarded);
    }
    match fragments.pop() {
        Some(last) => {
            let mut turn = LogicalTurn::single(id.clone(), last);
            turn.discarded = discarded;
            turn
        }
        None => LogicalTurn {
            conversation_id: id.clone(),
            text: String::new(),
            kind: Default::default(),
            fragment_count: 0,
            discarded: 0,
            first_arrived_at: Instant::now(),
            last_arrived_at: Instant::now(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FragmentKind;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn aggregator() -> (TurnAggregator, UnboundedReceiver<LogicalTurn>) {
        aggregator_with(AggregatorConfig::default())
    }

    fn aggregator_with(config: AggregatorConfig) -> (TurnAggregator, UnboundedReceiver<LogicalTurn>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TurnAggregator::new(config, tx), rx)
    }

    fn id() -> ConversationId {
        ConversationId::from("5511988887777")
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragments_one_second_apart_merge_into_one_turn() {
        let (agg, mut rx) = aggregator();
        let start = Instant::now();

        agg.on_fragment(&id(), Fragment::text("oi"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        agg.on_fragment(&id(), Fragment::text("queria"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        agg.on_fragment(&id(), Fragment::text("agendar banho"));

        let turn = rx.recv().await.unwrap();
        assert_eq!(turn.text, "oi queria agendar banho");
        assert_eq!(turn.fragment_count, 3);
        assert!(turn.is_merged());
        // Last fragment at t=2s plus the 3s window.
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(!agg.has_pending(&id()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_pause_produces_two_turns() {
        let (agg, mut rx) = aggregator();

        agg.on_fragment(&id(), Fragment::text("oi"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        let first = rx.try_recv().unwrap();
        assert_eq!(first.text, "oi");
        assert_eq!(first.fragment_count, 1);

        agg.on_fragment(&id(), Fragment::text("ainda aí?"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.text, "ainda aí?");
    }

    #[tokio::test(start_paused = true)]
    async fn test_trickle_keeps_deferring_flush() {
        let (agg, mut rx) = aggregator();
        for word in ["a", "b", "c", "d"] {
            agg.on_fragment(&id(), Fragment::text(word));
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            assert!(rx.try_recv().is_err(), "flushed before quiescence");
        }
        let turn = rx.recv().await.unwrap();
        assert_eq!(turn.text, "a b c d");
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_caps_deferral() {
        let config = AggregatorConfig {
            max_wait_ms: 6_000,
            ..AggregatorConfig::default()
        };
        let (agg, mut rx) = aggregator_with(config);
        let start = Instant::now();
        agg.on_fragment(&id(), Fragment::text("a"));
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        agg.on_fragment(&id(), Fragment::text("b"));
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        agg.on_fragment(&id(), Fragment::text("c"));

        // Window alone would flush at t=7s; the cap wins at t=6s.
        let turn = rx.recv().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert_eq!(turn.text, "a b c");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragment_cap_flushes_immediately() {
        let config = AggregatorConfig {
            max_fragments: 3,
            ..AggregatorConfig::default()
        };
        let (agg, mut rx) = aggregator_with(config);
        agg.on_fragment(&id(), Fragment::text("um"));
        agg.on_fragment(&id(), Fragment::text("dois"));
        assert!(rx.try_recv().is_err());
        agg.on_fragment(&id(), Fragment::text("três"));

        let turn = rx.try_recv().unwrap();
        assert_eq!(turn.text, "um dois três");
        assert!(!agg.has_pending(&id()));

        // The cancelled timer must not emit a second, empty turn.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_beyond_max_interval_keeps_only_last_fragment() {
        let (agg, mut rx) = aggregator();
        let t0 = Instant::now();
        agg.on_fragment(&id(), Fragment::at("oi", t0));
        agg.on_fragment(&id(), Fragment::at("ainda aí?", t0 + Duration::from_secs(10)));

        let turn = rx.recv().await.unwrap();
        assert_eq!(turn.text, "ainda aí?");
        assert_eq!(turn.fragment_count, 1);
        assert_eq!(turn.discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_bypasses_buffer() {
        let (agg, mut rx) = aggregator();
        agg.on_fragment(&id(), Fragment::text("olha"));
        agg.on_fragment(
            &id(),
            Fragment::text("[audio]").with_kind(FragmentKind::Voice),
        );

        let media = rx.try_recv().unwrap();
        assert_eq!(media.kind, FragmentKind::Voice);
        assert_eq!(media.text, "[audio]");
        // The text buffer is untouched.
        assert_eq!(agg.pending_count(&id()), 1);
        assert_eq!(rx.recv().await.unwrap().text, "olha");
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversations_are_independent() {
        let (agg, mut rx) = aggregator();
        let a = ConversationId::from("a");
        let b = ConversationId::from("b");
        agg.on_fragment(&a, Fragment::text("from a"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        agg.on_fragment(&b, Fragment::text("from b"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.conversation_id, a);
        assert_eq!(first.text, "from a");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.conversation_id, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragment_after_flush_starts_fresh_turn() {
        let (agg, mut rx) = aggregator();
        agg.on_fragment(&id(), Fragment::text("primeiro"));
        assert!(agg.flush_now(&id()));
        agg.on_fragment(&id(), Fragment::text("segundo"));

        assert_eq!(rx.try_recv().unwrap().text, "primeiro");
        assert_eq!(rx.recv().await.unwrap().text, "segundo");
        assert!(!agg.flush_now(&id()));
    }

    #[test]
    fn test_build_turn_orders_by_arrival() {
        let t0 = Instant::now();
        let fragments = vec![
            Fragment::at("b", t0 + Duration::from_secs(1)),
            Fragment::at("a", t0),
        ];
        let turn = build_turn(&id(), fragments, Duration::from_secs(5));
        assert_eq!(turn.text, "a b");
        assert_eq!(turn.first_arrived_at, t0);
    }
}
