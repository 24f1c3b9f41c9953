//! Follow-up persuasion: escalating re-engagement messages for conversations
//! that went quiet, and the irritation check that stops them.

pub mod irritation;
pub mod sequencer;
pub mod templates;

pub use irritation::{detect as detect_irritation, IrritationCategory, IrritationSignal};
pub use sequencer::{
    ArmOutcome, FollowUpSequence, LevelStatus, PersuasionSequencer, ScheduledLevel, SequenceSnapshot,
    SequenceState, UserMessageOutcome,
};
pub use templates::{EscalationTier, TemplateBook};
