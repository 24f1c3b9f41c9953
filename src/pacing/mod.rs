//! Delay model: how long a human would take to read the incoming turn and
//! type the outgoing reply.
//!
//! ```text
//! incoming words ─► reading time ─┐
//!                                 ├─► jitter ─► clamp [MIN, MAX] ─► PacingPlan
//! outgoing chars ─► typing time ──┘     (short replies: tighter band)
//!       ▲
//!       └── speed multiplier: short text, user latency, hour of day, urgency
//! ```

pub mod context;
pub mod delay;

pub use context::AdaptiveContext;
pub use delay::{compute_delay, DelayModel, PacingPlan};
