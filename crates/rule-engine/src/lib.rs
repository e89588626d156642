//! Automation rule engine for the domovoy controller
//!
//! Evaluates triggers (cron schedules, state-change events) and conditions
//! against live device state, dispatches ordered action lists with retry
//! and failure isolation, and routes matched voice commands into the same
//! action path.

pub mod clock;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod model;
pub mod scheduler;
pub mod voice;

pub use clock::{Clock, FixedClock, SystemClock};
pub use dispatcher::{CommandDispatcher, DispatchConfig, DispatchResult};
pub use engine::{Evaluation, EngineEvent, RuleEngine, SkipReason};
pub use error::EngineError;
pub use evaluator::{ConditionEvaluator, StateSnapshot};
pub use model::*;
pub use scheduler::{FiringState, TriggerScheduler};
pub use voice::{VoiceReply, VoiceRouter};
