//! # autoplay: judgment-and-playback engine
//!
//! Automates repetitive interactive tasks in three steps:
//!
//! ```text
//! Sense (capture + recognition) → Judge (rules, state machines) → Act (timed input replay)
//! ```
//!
//! ## Judge
//!
//! - Conditions ([`condition`]): a small expression language over the
//!   judgment context, parsed once and evaluated with short-circuit
//!   semantics.
//! - Rules ([`rule`]): condition plus then/else action lists, selected by
//!   priority when several match.
//! - State machines ([`state_machine`]): guarded transitions with entry
//!   actions.
//! - Judgment context ([`context`]): recognition results and variables of
//!   one decision cycle.
//!
//! ## Act
//!
//! - Actions ([`action`]): immutable input events and sequences.
//! - Sequencer ([`sequencer`]): replays a sequence with its recorded timing,
//!   scaled by a speed factor, under cooperative cancellation.
//!
//! ## Sense and wiring
//!
//! - Platform traits ([`hal`]): input driver, screen capture, recognizer.
//! - Orchestration ([`orchestrator`]): runs Sense → Judge → Act cycles.
//! - Events ([`event_bus`]): per-component broadcast observers.

pub mod action;
pub mod condition;
pub mod config;
pub mod context;
pub mod error;
pub mod event_bus;
pub mod hal;
pub mod orchestrator;
pub mod rule;
pub mod sequencer;
pub mod state_machine;
pub mod timestamp;

// Re-exports
pub use action::{ActionKind, ActionLibrary, ActionSequence, GameAction, KeyCode};
pub use condition::{Condition, ConditionEvaluator, ConditionExpression, Value, ValueResolver};
pub use config::EngineConfig;
pub use context::{JudgmentContext, RecognitionResult, SenseResult};
pub use error::*;
pub use orchestrator::{CycleEvent, CycleReport, Orchestrator, SenseOperation};
pub use rule::{DecisionRule, RuleEngine, RuleEvaluationResult, RuleStatus};
pub use sequencer::{ActionSequencer, PlayOptions, PlaybackEvent, PlaybackOutcome};
pub use state_machine::{State, StateMachine, StateMachineEngine, StateMachineResult, Transition};

#[cfg(test)]
mod tests {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    #[ctor::ctor]
    fn init_tests() {
        // テストの前に一度だけ tracing を初期化
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to set tracing subscriber");
    }
}
