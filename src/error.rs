use thiserror::Error;

use crate::condition::{ConditionError, EvalError};
use crate::config::ConfigError;
use crate::context::ContextError;
use crate::event_bus::EventError;
use crate::hal::HalError;
use crate::rule::RuleError;
use crate::sequencer::PlaybackError;
use crate::state_machine::StateMachineError;

#[derive(Error, Debug)]
pub enum Error {
    // condition
    #[error("Condition error: {0}")]
    Condition(#[from] ConditionError),
    #[error("Eval error: {0}")]
    Eval(#[from] EvalError),
    #[error("Context error: {0}")]
    Context(#[from] ContextError),
    // registries
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),
    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),
    // playback
    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),
    #[error("HAL error: {0}")]
    Hal(#[from] HalError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

// エラー作成用のヘルパー関数
impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
