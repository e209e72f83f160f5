use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::GameAction;

/// Ordered, immutable list of actions.
///
/// Derived values (`total_duration`, `action_count`) are computed whenever a
/// new sequence value is built, so they can never disagree with the list.
/// All edits are copy-on-write and share nothing mutable with the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SequenceRecord", into = "SequenceRecord")]
pub struct ActionSequence {
    id: Uuid,
    name: String,
    actions: Arc<[GameAction]>,
    total_duration: Duration,
    action_count: usize,
}

// 永続化用の形。派生値は含めない
#[derive(Serialize, Deserialize)]
struct SequenceRecord {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,
    #[serde(default)]
    name: String,
    #[serde(default)]
    actions: Vec<GameAction>,
}

impl From<SequenceRecord> for ActionSequence {
    fn from(record: SequenceRecord) -> Self {
        Self::build(record.id, record.name, record.actions)
    }
}

impl From<ActionSequence> for SequenceRecord {
    fn from(sequence: ActionSequence) -> Self {
        Self {
            id: sequence.id,
            name: sequence.name,
            actions: sequence.actions.to_vec(),
        }
    }
}

/// `duration / speed`, rounded to the nearest nanosecond.
pub(crate) fn scale(duration: Duration, speed: f64) -> Duration {
    let nanos = (duration.as_nanos() as f64 / speed).round();
    if nanos >= u64::MAX as f64 {
        Duration::from_nanos(u64::MAX)
    } else {
        Duration::from_nanos(nanos as u64)
    }
}

impl Default for ActionSequence {
    fn default() -> Self {
        Self::empty("")
    }
}

impl ActionSequence {
    pub fn new(name: impl Into<String>, actions: Vec<GameAction>) -> Self {
        Self::build(Uuid::new_v4(), name.into(), actions)
    }

    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    fn build(id: Uuid, name: String, actions: Vec<GameAction>) -> Self {
        let total_duration = actions.iter().map(GameAction::delay).sum();
        let action_count = actions.len();
        Self {
            id,
            name,
            actions: actions.into(),
            total_duration,
            action_count,
        }
    }

    fn rebuilt(&self, actions: Vec<GameAction>) -> Self {
        Self::build(self.id, self.name.clone(), actions)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actions(&self) -> &[GameAction] {
        &self.actions
    }

    pub fn get(&self, index: usize) -> Option<&GameAction> {
        self.actions.get(index)
    }

    pub fn is_empty(&self) -> bool {
        self.action_count == 0
    }

    pub fn action_count(&self) -> usize {
        self.action_count
    }

    /// Sum of every member delay.
    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    /// Wall-clock time a playback at speed 1.0 takes: the sum of the positive
    /// steps between consecutive cumulative delays. For a monotonic recording
    /// this is the delay of the last action.
    pub fn playback_duration(&self) -> Duration {
        let mut last = Duration::ZERO;
        let mut total = Duration::ZERO;
        for action in self.actions.iter() {
            total += action.delay().saturating_sub(last);
            last = action.delay();
        }
        total
    }

    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    pub fn with_actions(&self, actions: Vec<GameAction>) -> Self {
        self.rebuilt(actions)
    }

    pub fn push(&self, action: GameAction) -> Self {
        let mut actions = self.actions.to_vec();
        actions.push(action);
        self.rebuilt(actions)
    }

    /// Inserts before `index`; an index past the end appends.
    pub fn insert(&self, index: usize, action: GameAction) -> Self {
        let mut actions = self.actions.to_vec();
        actions.insert(index.min(actions.len()), action);
        self.rebuilt(actions)
    }

    pub fn remove(&self, index: usize) -> Option<Self> {
        if index >= self.action_count {
            return None;
        }
        let mut actions = self.actions.to_vec();
        actions.remove(index);
        Some(self.rebuilt(actions))
    }

    pub fn replace(&self, index: usize, action: GameAction) -> Option<Self> {
        if index >= self.action_count {
            return None;
        }
        let mut actions = self.actions.to_vec();
        actions[index] = action;
        Some(self.rebuilt(actions))
    }

    /// Same sequence with every offset divided by `speed`. Non-positive or
    /// non-finite speeds return `None`.
    pub fn scaled(&self, speed: f64) -> Option<Self> {
        if !speed.is_finite() || speed <= 0.0 {
            return None;
        }
        let actions = self
            .actions
            .iter()
            .map(|action| action.with_delay(scale(action.delay(), speed)))
            .collect();
        Some(self.rebuilt(actions))
    }

    /// Concatenates `other` after this sequence, shifting its offsets so they
    /// start where this sequence's playback ends.
    pub fn concat(&self, other: &ActionSequence) -> Self {
        let shift = self.actions.last().map(GameAction::delay).unwrap_or_default();
        let mut actions = self.actions.to_vec();
        actions.extend(
            other
                .actions()
                .iter()
                .map(|action| action.with_delay(action.delay() + shift)),
        );
        self.rebuilt(actions)
    }
}
