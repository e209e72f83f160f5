//! # State machines
//!
//! A [`StateMachine`] holds exactly one current state. On every decision
//! cycle the [`StateMachineEngine`] looks at the transitions leaving that
//! state, in declaration order, and takes the first one whose [`Guard`]
//! holds.

pub mod engine;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::condition::{Condition, ConditionError, ConditionExpression};

pub use engine::StateMachineEngine;

/// Reported as the current state of an id that is not registered.
pub const UNKNOWN_STATE: &str = "Unknown";
/// Reported as the current state when processing failed.
pub const ERROR_STATE: &str = "Error";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("State machine {machine_id} is invalid: {message}")]
    Validation { machine_id: String, message: String },
    #[error("Invalid guard on transition {from} -> {to} of {machine_id}: {source}")]
    Guard {
        machine_id: String,
        from: String,
        to: String,
        source: ConditionError,
    },
    #[error("State machine {machine_id} is already registered")]
    Duplicate { machine_id: String },
    #[error("State machine {machine_id} not found")]
    NotFound { machine_id: String },
    #[error("State {state_id} does not exist in {machine_id}")]
    UnknownState { machine_id: String, state_id: String },
}

pub type MachineResult<T> = Result<T, StateMachineError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub entry_actions: Vec<String>,
}

impl State {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            entry_actions: Vec::new(),
        }
    }

    pub fn with_entry_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entry_actions = actions.into_iter().map(Into::into).collect();
        self
    }
}

/// Condition attached to a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    /// Condition source text. Blank text always holds.
    Expression(String),
    Condition(ConditionExpression),
}

impl Default for Guard {
    fn default() -> Self {
        Guard::Expression(String::new())
    }
}

impl Guard {
    pub fn always() -> Self {
        Self::default()
    }

    pub fn compile(&self) -> Result<Condition, ConditionError> {
        match self {
            Guard::Expression(text) => Condition::parse(text),
            Guard::Condition(expression) => {
                expression.validate()?;
                Ok(Condition::from(expression))
            }
        }
    }
}

impl From<&str> for Guard {
    fn from(text: &str) -> Self {
        Guard::Expression(text.to_string())
    }
}

impl From<ConditionExpression> for Guard {
    fn from(expression: ConditionExpression) -> Self {
        Guard::Condition(expression)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub guard: Guard,
    #[serde(default)]
    pub actions: Vec<String>,
}

impl Transition {
    pub fn new(from: impl Into<String>, to: impl Into<String>, guard: impl Into<Guard>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: guard.into(),
            actions: Vec::new(),
        }
    }

    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = actions.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachine {
    id: String,
    name: String,
    current_state: String,
    #[serde(default)]
    states: Vec<State>,
    #[serde(default)]
    transitions: Vec<Transition>,
}

impl StateMachine {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        initial_state: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            current_state: initial_state.into(),
            states: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_state_id(&self) -> &str {
        &self.current_state
    }

    pub fn current_state(&self) -> Option<&State> {
        self.state(&self.current_state)
    }

    pub fn state(&self, state_id: &str) -> Option<&State> {
        self.states.iter().find(|s| s.id == state_id)
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub(crate) fn set_current_state(&mut self, state_id: impl Into<String>) {
        self.current_state = state_id.into();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachineResult {
    pub state_machine_id: String,
    pub current_state_id: String,
    #[serde(default)]
    pub triggered_actions: Vec<String>,
    pub success: bool,
    /// A transition was taken in this step.
    #[serde(default)]
    pub transitioned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StateMachineResult {
    pub fn unknown(machine_id: &str) -> Self {
        Self {
            state_machine_id: machine_id.to_string(),
            current_state_id: UNKNOWN_STATE.to_string(),
            triggered_actions: Vec::new(),
            success: false,
            transitioned: false,
            error: Some(
                StateMachineError::NotFound {
                    machine_id: machine_id.to_string(),
                }
                .to_string(),
            ),
        }
    }

    pub fn faulted(machine_id: &str, error: impl Into<String>) -> Self {
        Self {
            state_machine_id: machine_id.to_string(),
            current_state_id: ERROR_STATE.to_string(),
            triggered_actions: Vec::new(),
            success: false,
            transitioned: false,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_compile() {
        assert_eq!(Guard::always().compile().unwrap(), Condition::Always);
        assert!(matches!(
            Guard::from("recognition.*.Success == true").compile().unwrap(),
            Condition::Comparison { .. }
        ));
        assert!(Guard::from("recognition.*.Success ==").compile().is_err());
    }

    #[test]
    fn test_serde_shape() {
        let json = r#"{
            "id": "m",
            "name": "menu",
            "current_state": "idle",
            "states": [
                { "id": "idle", "name": "Idle" },
                { "id": "done", "name": "Done", "entry_actions": ["celebrate"] }
            ],
            "transitions": [
                { "from": "idle", "to": "done", "guard": { "expression": "variable.ready == true" } },
                { "from": "done", "to": "idle" }
            ]
        }"#;
        let machine: StateMachine = serde_json::from_str(json).unwrap();
        assert_eq!(machine.current_state().unwrap().name, "Idle");
        assert_eq!(machine.state("done").unwrap().entry_actions, vec!["celebrate"]);
        assert_eq!(machine.transitions()[1].guard, Guard::always());
    }

    #[test]
    fn test_result_constructors() {
        let unknown = StateMachineResult::unknown("m");
        assert_eq!(unknown.current_state_id, "Unknown");
        assert!(!unknown.success);
        let faulted = StateMachineResult::faulted("m", "boom");
        assert_eq!(faulted.current_state_id, "Error");
        assert_eq!(faulted.error.as_deref(), Some("boom"));
    }
}
