//! Conversational engagement engine.
//!
//! Decides, per channel, when the agent speaks and whether it may speak at
//! all: a debounced wait per channel, a decaying mute level per channel, and
//! one-shot "join in" episodes that collapse repeated triggers into a single
//! action.

pub mod apprehension;
pub mod clock;
pub mod config;
pub mod decay;
pub mod engine;
pub mod episode;
pub mod error;
pub mod keywords;
pub mod scheduler;
pub mod speaker;

pub use apprehension::ApprehensionStore;
pub use clock::{
    Clock, Dice, FixedDice, ReadyGate, SeededDice, ThreadDice, TimerOutcome, TokioClock,
    wait_or_cancel,
};
pub use config::{EngineConfig, SecondsRange};
pub use decay::DecayTicker;
pub use engine::{ActivityEvent, ActivityVerdict, EngagementEngine, ReactionEvent, ReactionVerdict};
pub use episode::{Episode, EpisodeCoordinator};
pub use error::{EngineError, Result};
pub use keywords::{KeywordMatcher, PhraseMatch, is_addressed, normalize, requires_address};
pub use scheduler::{EngagementScheduler, PendingView, SchedulerParts, SessionOutcome};
pub use speaker::{ReplySource, Speaker};
