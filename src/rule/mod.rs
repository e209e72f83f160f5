//! # Decision rules
//!
//! A [`DecisionRule`] pairs one condition with two action lists: `then`
//! actions when the condition holds, `else` actions when it does not. Rules
//! are values; once registered in the [`RuleEngine`] only their status can
//! change.

pub mod engine;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::condition::{ConditionError, ConditionExpression};

pub use engine::{select_winner, RuleEngine, RuleRank};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuleError {
    #[error("Rule {rule_id} is invalid: {message}")]
    Validation { rule_id: String, message: String },
    #[error("Rule {rule_id} does not reference any of {namespaces}")]
    MissingNamespace { rule_id: String, namespaces: String },
    #[error("Rule {rule_id} is already registered")]
    Duplicate { rule_id: String },
    #[error("Rule {rule_id} not found")]
    NotFound { rule_id: String },
    #[error("Invalid condition: {0}")]
    Condition(#[from] ConditionError),
}

pub type RuleResult<T> = Result<T, RuleError>;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum RuleStatus {
    #[default]
    Active,
    Inactive,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRule {
    id: String,
    name: String,
    condition: ConditionExpression,
    #[serde(default)]
    then_actions: Vec<String>,
    #[serde(default)]
    else_actions: Vec<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    status: RuleStatus,
}

impl DecisionRule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        condition: ConditionExpression,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            condition,
            then_actions: Vec::new(),
            else_actions: Vec::new(),
            priority: 0,
            status: RuleStatus::Active,
        }
    }

    /// Builds a rule from a condition string.
    pub fn parse(
        id: impl Into<String>,
        name: impl Into<String>,
        condition: &str,
    ) -> RuleResult<Self> {
        Ok(Self::new(id, name, ConditionExpression::parse(condition)?))
    }

    pub fn with_then_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.then_actions = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_else_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.else_actions = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_status(mut self, status: RuleStatus) -> Self {
        self.status = status;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn condition(&self) -> &ConditionExpression {
        &self.condition
    }

    pub fn then_actions(&self) -> &[String] {
        &self.then_actions
    }

    pub fn else_actions(&self) -> &[String] {
        &self.else_actions
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn status(&self) -> RuleStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: RuleStatus) {
        self.status = status;
    }
}

/// Outcome of evaluating one rule. Unknown rules and evaluation faults are
/// reported here with `matched = false` and an error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluationResult {
    pub rule_id: String,
    pub matched: bool,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub actions: Vec<String>,
}

impl RuleEvaluationResult {
    pub fn not_found(rule_id: &str) -> Self {
        Self::failed(
            rule_id,
            RuleError::NotFound {
                rule_id: rule_id.to_string(),
            }
            .to_string(),
        )
    }

    pub fn failed(rule_id: &str, error: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            matched: false,
            confidence: 0.0,
            error: Some(error.into()),
            actions: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builder() {
        let rule = DecisionRule::parse("r1", "press start", "recognition.Start.Success == true")
            .unwrap()
            .with_then_actions(["press_start"])
            .with_else_actions(vec!["wait".to_string()])
            .with_priority(50);

        assert_eq!(rule.id(), "r1");
        assert_eq!(rule.then_actions(), ["press_start".to_string()]);
        assert_eq!(rule.else_actions(), ["wait".to_string()]);
        assert_eq!(rule.priority(), 50);
        assert_eq!(rule.status(), RuleStatus::Active);
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            DecisionRule::parse("r1", "broken", "variable.a =="),
            Err(RuleError::Condition(ConditionError::Syntax { .. }))
        ));
    }

    #[test]
    fn test_serde_defaults() {
        let json = r#"{
            "id": "r1",
            "name": "n",
            "condition": {
                "left_operand": { "reference": "variable.hp" },
                "operator": "<",
                "right_operand": { "literal": 20 }
            },
            "then_actions": ["heal"]
        }"#;
        let rule: DecisionRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.priority(), 0);
        assert_eq!(rule.status(), RuleStatus::Active);
        assert!(rule.else_actions().is_empty());
        assert_eq!(rule.condition().to_string(), "variable.hp < 20");
    }

    #[test]
    fn test_not_found_result() {
        let result = RuleEvaluationResult::not_found("ghost");
        assert!(!result.matched);
        assert!(result.actions.is_empty());
        assert_eq!(result.error.as_deref(), Some("Rule ghost not found"));
    }
}
