//! Adaptive inputs to the delay model.

use std::time::Duration;

use chrono::{FixedOffset, Local, Timelike, Utc};

use crate::types::Urgency;

/// Per-turn context the delay model adapts to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveContext {
    /// How long the user took to reply to our previous response, if known.
    pub user_reply_latency: Option<Duration>,
    /// Hour of day (0..24) in the user's local time.
    pub local_hour: u32,
    pub urgency: Urgency,
}

impl Default for AdaptiveContext {
    fn default() -> Self {
        Self {
            user_reply_latency: None,
            local_hour: 14,
            urgency: Urgency::Normal,
        }
    }
}

impl AdaptiveContext {
    /// Build a context for "now", deriving the local hour from a fixed UTC
    /// offset or, when `None`, from the host time zone.
    pub fn now(
        utc_offset_minutes: Option<i32>,
        user_reply_latency: Option<Duration>,
        urgency: Urgency,
    ) -> Self {
        Self {
            user_reply_latency,
            local_hour: current_local_hour(utc_offset_minutes),
            urgency,
        }
    }

    pub fn with_hour(mut self, hour: u32) -> Self {
        self.local_hour = hour % 24;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.user_reply_latency = Some(latency);
        self
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }
}

fn current_local_hour(utc_offset_minutes: Option<i32>) -> u32 {
    match utc_offset_minutes.and_then(|m| FixedOffset::east_opt(m * 60)) {
        Some(offset) => Utc::now().with_timezone(&offset).hour(),
        None => Local::now().hour(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_hour_wraps() {
        let ctx = AdaptiveContext::default().with_hour(25);
        assert_eq!(ctx.local_hour, 1);
    }

    #[test]
    fn test_now_with_offset_yields_valid_hour() {
        let ctx = AdaptiveContext::now(Some(-180), None, Urgency::High);
        assert!(ctx.local_hour < 24);
        assert_eq!(ctx.urgency, Urgency::High);
    }
}
