//! Reading + typing delay model.
//!
//! Pure functions only: all randomness comes from the caller's RNG, so a
//! seeded RNG reproduces the same delay for the same inputs.

use std::time::Duration;

use rand::Rng;

use super::context::AdaptiveContext;
use crate::config::PacingConfig;
use crate::types::Urgency;

/// The two pauses a paced reply goes through before it is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPlan {
    /// Pause while the incoming text is "read".
    pub reading: Duration,
    /// Pause with the typing indicator on.
    pub typing: Duration,
}

impl PacingPlan {
    pub fn total(&self) -> Duration {
        self.reading + self.typing
    }
}

/// Stateless delay model bound to a configuration.
#[derive(Debug, Clone, Default)]
pub struct DelayModel {
    config: PacingConfig,
}

impl DelayModel {
    pub fn new(config: PacingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    /// Total bounded delay for a reply.
    pub fn compute_delay<R: Rng + ?Sized>(
        &self,
        incoming: &str,
        outgoing: &str,
        context: &AdaptiveContext,
        rng: &mut R,
    ) -> Duration {
        compute_delay(incoming, outgoing, context, &self.config, rng)
    }

    /// Same total as [`compute_delay`](Self::compute_delay), split into the
    /// reading and typing pauses in proportion to their raw estimates.
    pub fn plan<R: Rng + ?Sized>(
        &self,
        incoming: &str,
        outgoing: &str,
        context: &AdaptiveContext,
        rng: &mut R,
    ) -> PacingPlan {
        let reading = reading_secs(incoming, &self.config);
        let typing = typing_secs(outgoing, context, &self.config);
        let total = bounded_total(reading + typing, outgoing, &self.config, rng);

        let raw = reading + typing;
        let reading_share = if raw > 0.0 { reading / raw } else { 0.0 };
        let reading = total.mul_f64(reading_share);
        PacingPlan {
            reading,
            typing: total.saturating_sub(reading),
        }
    }
}

/// Compute a reading-plus-typing delay, jittered and clamped.
///
/// The result always lies in `[min_delay, max_delay]`; outgoing texts of at
/// most `short_text_chars` characters additionally lie in the short band.
pub fn compute_delay<R: Rng + ?Sized>(
    incoming: &str,
    outgoing: &str,
    context: &AdaptiveContext,
    config: &PacingConfig,
    rng: &mut R,
) -> Duration {
    let raw = reading_secs(incoming, config) + typing_secs(outgoing, context, config);
    bounded_total(raw, outgoing, config, rng)
}

fn bounded_total<R: Rng + ?Sized>(
    raw_secs: f64,
    outgoing: &str,
    config: &PacingConfig,
    rng: &mut R,
) -> Duration {
    let jittered = raw_secs * jitter_factor(config.jitter, rng);
    let (min, max) = if outgoing.chars().count() <= config.short_text_chars {
        (config.short_min_delay_ms, config.short_max_delay_ms)
    } else {
        (config.min_delay_ms, config.max_delay_ms)
    };
    let millis = (jittered * 1000.0).round().clamp(min as f64, max as f64);
    Duration::from_millis(millis as u64)
}

fn jitter_factor<R: Rng + ?Sized>(jitter: f64, rng: &mut R) -> f64 {
    if jitter <= 0.0 {
        return 1.0;
    }
    rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
}

fn reading_secs(incoming: &str, config: &PacingConfig) -> f64 {
    let words = incoming.split_whitespace().count() as f64;
    words * 60.0 / config.reading_wpm
}

fn typing_secs(outgoing: &str, context: &AdaptiveContext, config: &PacingConfig) -> f64 {
    let chars = outgoing.chars().count();
    let speed = short_text_multiplier(chars, config.short_text_chars)
        * latency_multiplier(context.user_reply_latency)
        * hour_multiplier(context.local_hour)
        * urgency_multiplier(context.urgency);
    chars as f64 / (config.typing_chars_per_sec * speed)
}

/// Short chat replies get typed disproportionately fast.
fn short_text_multiplier(chars: usize, short_text_chars: usize) -> f64 {
    if chars <= short_text_chars {
        1.8
    } else if chars <= 80 {
        1.3
    } else {
        1.0
    }
}

/// Mirror the user's own tempo: quick repliers get quicker answers.
fn latency_multiplier(latency: Option<Duration>) -> f64 {
    match latency {
        Some(l) if l < Duration::from_secs(15) => 1.2,
        Some(l) if l > Duration::from_secs(120) => 0.85,
        _ => 1.0,
    }
}

fn hour_multiplier(hour: u32) -> f64 {
    match hour {
        0..=5 => 0.75,
        6..=10 => 1.15,
        22..=23 => 0.85,
        _ => 1.0,
    }
}

fn urgency_multiplier(urgency: Urgency) -> f64 {
    match urgency {
        Urgency::High => 1.25,
        Urgency::Normal => 1.0,
        Urgency::Low => 0.95,
    }
}
