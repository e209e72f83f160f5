//! # Conditions
//!
//! Rules and state machine guards are written as small boolean expressions
//! over the judgment context:
//!
//! ```text
//! recognition.StartButton.Confidence > 0.8 AND variable.retries < 3
//! ```
//!
//! Two representations exist:
//!
//! * [`ConditionExpression`]: the authored record. A comparison optionally
//!   chained to the next expression through `AND`/`OR`. This is what gets
//!   persisted and displayed.
//! * [`Condition`]: the compiled tree (`Comparison`, `And`, `Or`) that the
//!   [`evaluator`] walks. It is built once when a rule or state machine is
//!   registered, never per evaluation.
//!
//! Chains associate to the right: `a AND b OR c` means `a AND (b OR c)`,
//! matching the order in which the linked record is walked.

pub mod evaluator;
pub mod parser;
pub mod value;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use evaluator::{ConditionEvaluator, EvalError, EvalResult, ValueResolver};
pub use value::Value;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConditionError {
    #[error("Condition expression is empty")]
    Empty,
    #[error("Syntax error in condition `{input}`: {message}")]
    Syntax { input: String, message: String },
    #[error("Operand reference is empty")]
    EmptyReference,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum ComparisonOperator {
    #[strum(serialize = "==")]
    #[serde(rename = "==")]
    Equal,
    #[strum(serialize = "!=")]
    #[serde(rename = "!=")]
    NotEqual,
    #[strum(serialize = ">")]
    #[serde(rename = ">")]
    GreaterThan,
    #[strum(serialize = ">=")]
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[strum(serialize = "<")]
    #[serde(rename = "<")]
    LessThan,
    #[strum(serialize = "<=")]
    #[serde(rename = "<=")]
    LessThanOrEqual,
    #[strum(serialize = "contains")]
    #[serde(rename = "contains")]
    Contains,
    #[strum(serialize = "startsWith")]
    #[serde(rename = "startsWith")]
    StartsWith,
    #[strum(serialize = "endsWith")]
    #[serde(rename = "endsWith")]
    EndsWith,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum LogicalOperator {
    #[strum(to_string = "AND", serialize = "&&")]
    #[serde(rename = "AND")]
    And,
    #[strum(to_string = "OR", serialize = "||")]
    #[serde(rename = "OR")]
    Or,
}

/// One side of a comparison: a key resolved through the context, or a constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Reference(String),
    Literal(Value),
}

impl Operand {
    pub fn reference(key: impl Into<String>) -> Self {
        Operand::Reference(key.into())
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Operand::Literal(value.into())
    }

    pub fn as_reference(&self) -> Option<&str> {
        match self {
            Operand::Reference(key) => Some(key),
            Operand::Literal(_) => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reference(key) => write!(f, "{}", key),
            Operand::Literal(Value::String(s)) => write!(
                f,
                "\"{}\"",
                s.replace('\\', "\\\\").replace('"', "\\\"")
            ),
            // 整数と区別できるよう小数点を残す
            Operand::Literal(Value::Float(v)) if v.is_finite() && v.fract() == 0.0 => {
                write!(f, "{:.1}", v)
            }
            Operand::Literal(value) => write!(f, "{}", value),
        }
    }
}

/// Link from one comparison to the next one in a chain.
///
/// The operator and the next node live together, so a logical operator
/// without a following expression cannot be represented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionChain {
    pub operator: LogicalOperator,
    pub next: Box<ConditionExpression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionExpression {
    pub left_operand: Operand,
    pub operator: ComparisonOperator,
    pub right_operand: Operand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<ConditionChain>,
}

impl ConditionExpression {
    pub fn new(left: Operand, operator: ComparisonOperator, right: Operand) -> Self {
        Self {
            left_operand: left,
            operator,
            right_operand: right,
            chain: None,
        }
    }

    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        parser::parse_condition(input)
    }

    /// Appends `next` with `AND` at the end of the chain.
    pub fn and(self, next: ConditionExpression) -> Self {
        self.append(LogicalOperator::And, next)
    }

    /// Appends `next` with `OR` at the end of the chain.
    pub fn or(self, next: ConditionExpression) -> Self {
        self.append(LogicalOperator::Or, next)
    }

    fn append(mut self, operator: LogicalOperator, next: ConditionExpression) -> Self {
        self.chain = Some(match self.chain.take() {
            None => ConditionChain {
                operator,
                next: Box::new(next),
            },
            Some(chain) => ConditionChain {
                operator: chain.operator,
                next: Box::new((*chain.next).append(operator, next)),
            },
        });
        self
    }

    /// Every comparison in the chain, in evaluation order.
    pub fn comparisons(&self) -> Comparisons<'_> {
        Comparisons {
            current: Some(self),
        }
    }

    /// Every context key referenced anywhere in the chain.
    pub fn references(&self) -> Vec<&str> {
        self.comparisons()
            .flat_map(|c| [c.left_operand.as_reference(), c.right_operand.as_reference()])
            .flatten()
            .collect()
    }

    /// Checks that every referenced key is non-empty.
    pub fn validate(&self) -> Result<(), ConditionError> {
        if self.references().iter().any(|key| key.trim().is_empty()) {
            return Err(ConditionError::EmptyReference);
        }
        Ok(())
    }
}

pub struct Comparisons<'a> {
    current: Option<&'a ConditionExpression>,
}

impl<'a> Iterator for Comparisons<'a> {
    type Item = &'a ConditionExpression;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        self.current = current.chain.as_ref().map(|chain| chain.next.as_ref());
        Some(current)
    }
}

impl fmt::Display for ConditionExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.left_operand, self.operator, self.right_operand
        )?;
        if let Some(chain) = &self.chain {
            write!(f, " {} {}", chain.operator, chain.next)?;
        }
        Ok(())
    }
}

impl FromStr for ConditionExpression {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Compiled condition tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Holds unconditionally. Produced by an empty guard.
    Always,
    Comparison {
        left: Operand,
        op: ComparisonOperator,
        right: Operand,
    },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    /// Parses and compiles in one go. Blank input compiles to [`Condition::Always`].
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        if input.trim().is_empty() {
            return Ok(Condition::Always);
        }
        let expression = ConditionExpression::parse(input)?;
        expression.validate()?;
        Ok(Condition::from(&expression))
    }
}

impl From<&ConditionExpression> for Condition {
    fn from(expression: &ConditionExpression) -> Self {
        let comparison = Condition::Comparison {
            left: expression.left_operand.clone(),
            op: expression.operator,
            right: expression.right_operand.clone(),
        };
        match &expression.chain {
            None => comparison,
            Some(chain) => {
                let rest = Condition::from(chain.next.as_ref());
                match chain.operator {
                    LogicalOperator::And => Condition::And(Box::new(comparison), Box::new(rest)),
                    LogicalOperator::Or => Condition::Or(Box::new(comparison), Box::new(rest)),
                }
            }
        }
    }
}

impl From<ConditionExpression> for Condition {
    fn from(expression: ConditionExpression) -> Self {
        Condition::from(&expression)
    }
}
