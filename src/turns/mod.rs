//! Turn intake: debounce fragments into logical turns, then admit at most
//! one turn per conversation at a time.

pub mod admission;
pub mod aggregator;

pub use admission::{AdmissionGuard, AdmissionToken};
pub use aggregator::{build_turn, PendingTurn, TurnAggregator};
