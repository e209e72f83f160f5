use dashmap::DashMap;
use tracing::debug;

use super::ActionSequence;

/// Named action sequences that rules and state machines refer to by name.
#[derive(Default)]
pub struct ActionLibrary {
    sequences: DashMap<String, ActionSequence>,
}

/// Result of resolving a list of action names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedActions {
    pub sequences: Vec<(String, ActionSequence)>,
    pub missing: Vec<String>,
}

impl ActionLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sequence under `name`, returning the one it replaced.
    pub fn register(
        &self,
        name: impl Into<String>,
        sequence: ActionSequence,
    ) -> Option<ActionSequence> {
        let name = name.into();
        debug!(%name, actions = sequence.action_count(), "action registered");
        self.sequences.insert(name, sequence)
    }

    pub fn get(&self, name: &str) -> Option<ActionSequence> {
        self.sequences.get(name).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<ActionSequence> {
        self.sequences.remove(name).map(|(_, sequence)| sequence)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sequences.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.sequences.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Looks every name up, keeping the order of `names`.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> ResolvedActions {
        let mut resolved = ResolvedActions::default();
        for name in names {
            let name = name.as_ref();
            match self.get(name) {
                Some(sequence) => resolved.sequences.push((name.to_string(), sequence)),
                None => resolved.missing.push(name.to_string()),
            }
        }
        resolved
    }
}
