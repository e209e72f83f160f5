use std::collections::HashSet;

use dashmap::{mapref::entry::Entry, DashMap};
use tracing::{debug, info, warn};

use super::{MachineResult, StateMachine, StateMachineError, StateMachineResult};
use crate::condition::{Condition, ConditionEvaluator, ValueResolver};

struct RegisteredMachine {
    machine: StateMachine,
    // transitions と同じ順序
    guards: Vec<Condition>,
}

/// Registry of state machines and the step function that drives them.
///
/// Each machine sits behind its own map entry: processing one machine holds
/// that entry exclusively, so two cycles never step the same machine at
/// once, while different machines proceed independently.
#[derive(Default)]
pub struct StateMachineEngine {
    machines: DashMap<String, RegisteredMachine>,
    evaluator: ConditionEvaluator,
}

fn invalid(machine: &StateMachine, message: impl Into<String>) -> StateMachineError {
    StateMachineError::Validation {
        machine_id: machine.id().to_string(),
        message: message.into(),
    }
}

/// Validates a machine definition and compiles its guards.
fn compile(machine: &StateMachine) -> MachineResult<Vec<Condition>> {
    if machine.id().trim().is_empty() {
        return Err(invalid(machine, "state machine id is empty"));
    }
    if machine.states().is_empty() {
        return Err(invalid(machine, "no states defined"));
    }
    let mut ids = HashSet::new();
    for state in machine.states() {
        if !ids.insert(state.id.as_str()) {
            return Err(invalid(machine, format!("duplicate state id {}", state.id)));
        }
    }
    let unknown = |state_id: &str| StateMachineError::UnknownState {
        machine_id: machine.id().to_string(),
        state_id: state_id.to_string(),
    };
    if !ids.contains(machine.current_state_id()) {
        return Err(unknown(machine.current_state_id()));
    }

    machine
        .transitions()
        .iter()
        .map(|transition| {
            for endpoint in [&transition.from, &transition.to] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(unknown(endpoint.as_str()));
                }
            }
            transition
                .guard
                .compile()
                .map_err(|source| StateMachineError::Guard {
                    machine_id: machine.id().to_string(),
                    from: transition.from.clone(),
                    to: transition.to.clone(),
                    source,
                })
        })
        .collect()
}

impl StateMachineEngine {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(level = "debug", skip(self, machine), fields(machine_id = %machine.id()))]
    pub fn create_state_machine(&self, machine: StateMachine) -> MachineResult<()> {
        let guards = compile(&machine)?;
        match self.machines.entry(machine.id().to_string()) {
            Entry::Occupied(_) => Err(StateMachineError::Duplicate {
                machine_id: machine.id().to_string(),
            }),
            Entry::Vacant(entry) => {
                info!(
                    name = %machine.name(),
                    states = machine.states().len(),
                    transitions = machine.transitions().len(),
                    "state machine created"
                );
                entry.insert(RegisteredMachine { machine, guards });
                Ok(())
            }
        }
    }

    /// Replaces the definition of a registered machine, including its
    /// current state.
    #[tracing::instrument(level = "debug", skip(self, machine), fields(machine_id = %machine.id()))]
    pub fn update_state_machine(&self, machine: StateMachine) -> MachineResult<()> {
        let guards = compile(&machine)?;
        let mut entry =
            self.machines
                .get_mut(machine.id())
                .ok_or_else(|| StateMachineError::NotFound {
                    machine_id: machine.id().to_string(),
                })?;
        info!("state machine updated");
        *entry = RegisteredMachine { machine, guards };
        Ok(())
    }

    pub fn get_state_machine(&self, machine_id: &str) -> Option<StateMachine> {
        self.machines
            .get(machine_id)
            .map(|entry| entry.machine.clone())
    }

    pub fn remove_state_machine(&self, machine_id: &str) -> Option<StateMachine> {
        self.machines
            .remove(machine_id)
            .map(|(_, entry)| entry.machine)
    }

    pub fn machine_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.machines.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Forces the current state without running any action.
    pub fn reset(&self, machine_id: &str, state_id: &str) -> MachineResult<()> {
        let mut entry = self
            .machines
            .get_mut(machine_id)
            .ok_or_else(|| StateMachineError::NotFound {
                machine_id: machine_id.to_string(),
            })?;
        if entry.machine.state(state_id).is_none() {
            return Err(StateMachineError::UnknownState {
                machine_id: machine_id.to_string(),
                state_id: state_id.to_string(),
            });
        }
        entry.machine.set_current_state(state_id);
        info!(machine_id, state_id, "state machine reset");
        Ok(())
    }

    /// Runs one step: takes the first transition out of the current state
    /// whose guard holds.
    ///
    /// Triggered actions are the transition's actions followed by the target
    /// state's entry actions. Unknown ids and guard faults are reported in the
    /// result and leave the machine untouched.
    #[tracing::instrument(level = "debug", skip(self, resolver))]
    pub fn process<R: ValueResolver + ?Sized>(
        &self,
        machine_id: &str,
        resolver: &R,
    ) -> StateMachineResult {
        let Some(mut entry) = self.machines.get_mut(machine_id) else {
            warn!("state machine not found");
            return StateMachineResult::unknown(machine_id);
        };
        let RegisteredMachine { machine, guards } = &mut *entry;
        let current = machine.current_state_id().to_string();

        let mut taken = None;
        for (transition, guard) in machine.transitions().iter().zip(guards.iter()) {
            if transition.from != current {
                continue;
            }
            match self.evaluator.try_evaluate(guard, resolver) {
                Ok(true) => {
                    taken = Some(transition);
                    break;
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(%error, from = %transition.from, to = %transition.to, "guard evaluation failed");
                    return StateMachineResult::faulted(machine_id, error.to_string());
                }
            }
        }

        let Some(transition) = taken else {
            debug!(state = %current, "no transition");
            return StateMachineResult {
                state_machine_id: machine_id.to_string(),
                current_state_id: current,
                triggered_actions: Vec::new(),
                success: true,
                transitioned: false,
                error: None,
            };
        };

        let target = transition.to.clone();
        let mut triggered_actions = transition.actions.clone();
        match machine.state(&target) {
            Some(state) => triggered_actions.extend(state.entry_actions.iter().cloned()),
            None => {
                return StateMachineResult::faulted(
                    machine_id,
                    StateMachineError::UnknownState {
                        machine_id: machine_id.to_string(),
                        state_id: target,
                    }
                    .to_string(),
                )
            }
        }

        info!(from = %current, to = %target, actions = triggered_actions.len(), "transition");
        machine.set_current_state(target.clone());
        StateMachineResult {
            state_machine_id: machine_id.to_string(),
            current_state_id: target,
            triggered_actions,
            success: true,
            transitioned: true,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{EvalError, EvalResult, Value};
    use crate::context::{JudgmentContext, RecognitionResult, SenseResult};
    use crate::state_machine::{State, Transition};
    use pretty_assertions::assert_eq;

    fn battle_machine() -> StateMachine {
        StateMachine::new("battle", "Battle", "idle")
            .with_state(State::new("idle", "Idle"))
            .with_state(State::new("success", "Success").with_entry_actions(["collect", "confirm"]))
            .with_state(State::new("failure", "Failure").with_entry_actions(["retry"]))
            .with_transition(
                Transition::new("idle", "success", "recognition.*.Success == true")
                    .with_actions(["stop_attack"]),
            )
            .with_transition(Transition::new("idle", "failure", "variable.hp <= 0"))
            .with_transition(Transition::new("success", "idle", ""))
    }

    fn empty(_: &str) -> Option<Value> {
        None
    }

    #[test]
    fn test_idle_to_success() {
        let engine = StateMachineEngine::new();
        engine.create_state_machine(battle_machine()).unwrap();

        let mut context = JudgmentContext::new();
        context
            .insert_sense_result(SenseResult::new(
                "Victory",
                vec![RecognitionResult::new("victory_banner", true, 0.93)],
            ))
            .unwrap();

        let result = engine.process("battle", &context);
        assert!(result.success);
        assert!(result.transitioned);
        assert_eq!(result.current_state_id, "success");
        assert_eq!(
            result.triggered_actions,
            vec!["stop_attack", "collect", "confirm"]
        );
        assert_eq!(
            engine.get_state_machine("battle").unwrap().current_state_id(),
            "success"
        );

        // Empty guard: unconditional.
        let back = engine.process("battle", &JudgmentContext::new());
        assert_eq!(back.current_state_id, "idle");
        assert!(back.triggered_actions.is_empty());
    }

    #[test]
    fn test_no_transition_keeps_state() {
        let engine = StateMachineEngine::new();
        engine.create_state_machine(battle_machine()).unwrap();

        let result = engine.process("battle", &empty);
        assert!(result.success);
        assert!(!result.transitioned);
        assert_eq!(result.current_state_id, "idle");
        assert!(result.triggered_actions.is_empty());
    }

    #[test]
    fn test_first_matching_transition_wins() {
        let engine = StateMachineEngine::new();
        engine
            .create_state_machine(
                StateMachine::new("m", "m", "a")
                    .with_state(State::new("a", "A"))
                    .with_state(State::new("b", "B").with_entry_actions(["to_b"]))
                    .with_state(State::new("c", "C").with_entry_actions(["to_c"]))
                    .with_transition(Transition::new("a", "b", "variable.x > 1"))
                    .with_transition(Transition::new("a", "c", "variable.x > 0")),
            )
            .unwrap();

        let result = engine.process("m", &|_: &str| Some(Value::Integer(5)));
        assert_eq!(result.current_state_id, "b");
        assert_eq!(result.triggered_actions, vec!["to_b"]);
    }

    #[test]
    fn test_unknown_machine() {
        let engine = StateMachineEngine::new();
        let result = engine.process("ghost", &empty);
        assert!(!result.success);
        assert_eq!(result.current_state_id, "Unknown");
    }

    #[test]
    fn test_fault_leaves_machine_untouched() {
        struct Broken;
        impl ValueResolver for Broken {
            fn resolve(&self, key: &str) -> EvalResult<Option<Value>> {
                Err(EvalError::Resolve {
                    key: key.to_string(),
                    message: "capture lost".to_string(),
                })
            }
        }

        let engine = StateMachineEngine::new();
        engine.create_state_machine(battle_machine()).unwrap();
        let result = engine.process("battle", &Broken);
        assert!(!result.success);
        assert_eq!(result.current_state_id, "Error");
        assert!(result.error.unwrap().contains("capture lost"));
        assert_eq!(
            engine.get_state_machine("battle").unwrap().current_state_id(),
            "idle"
        );
    }

    #[test]
    fn test_validation() {
        let engine = StateMachineEngine::new();
        assert!(matches!(
            engine.create_state_machine(StateMachine::new("m", "m", "a")),
            Err(StateMachineError::Validation { .. })
        ));
        assert!(matches!(
            engine.create_state_machine(
                StateMachine::new("m", "m", "a")
                    .with_state(State::new("a", "A"))
                    .with_state(State::new("a", "again"))
            ),
            Err(StateMachineError::Validation { .. })
        ));
        assert!(matches!(
            engine.create_state_machine(
                StateMachine::new("m", "m", "nowhere").with_state(State::new("a", "A"))
            ),
            Err(StateMachineError::UnknownState { .. })
        ));
        assert!(matches!(
            engine.create_state_machine(
                StateMachine::new("m", "m", "a")
                    .with_state(State::new("a", "A"))
                    .with_transition(Transition::new("a", "b", ""))
            ),
            Err(StateMachineError::UnknownState { .. })
        ));
        assert!(matches!(
            engine.create_state_machine(
                StateMachine::new("m", "m", "a")
                    .with_state(State::new("a", "A"))
                    .with_transition(Transition::new("a", "a", "variable.x >"))
            ),
            Err(StateMachineError::Guard { .. })
        ));
        assert!(engine.machine_ids().is_empty());
    }

    #[test]
    fn test_duplicate_and_update() {
        let engine = StateMachineEngine::new();
        engine.create_state_machine(battle_machine()).unwrap();
        assert_eq!(
            engine.create_state_machine(battle_machine()),
            Err(StateMachineError::Duplicate {
                machine_id: "battle".to_string()
            })
        );

        let unknown = StateMachine::new("other", "Other", "a").with_state(State::new("a", "A"));
        assert_eq!(
            engine.update_state_machine(unknown),
            Err(StateMachineError::NotFound {
                machine_id: "other".to_string()
            })
        );

        let updated = StateMachine::new("battle", "Battle v2", "failure")
            .with_state(State::new("failure", "Failure"));
        engine.update_state_machine(updated).unwrap();
        let stored = engine.get_state_machine("battle").unwrap();
        assert_eq!(stored.name(), "Battle v2");
        assert_eq!(stored.current_state_id(), "failure");
    }

    #[test]
    fn test_reset() {
        let engine = StateMachineEngine::new();
        engine.create_state_machine(battle_machine()).unwrap();
        engine.reset("battle", "failure").unwrap();
        assert_eq!(
            engine.get_state_machine("battle").unwrap().current_state_id(),
            "failure"
        );
        assert!(matches!(
            engine.reset("battle", "nowhere"),
            Err(StateMachineError::UnknownState { .. })
        ));
        assert!(matches!(
            engine.reset("ghost", "idle"),
            Err(StateMachineError::NotFound { .. })
        ));
        assert!(engine.remove_state_machine("battle").is_some());
        assert!(engine.get_state_machine("battle").is_none());
    }
}
