use thiserror::Error;
use tracing::{debug, warn};

use super::{ComparisonOperator, Condition, ConditionExpression, LogicalOperator, Operand, Value};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("Failed to resolve `{key}`: {message}")]
    Resolve { key: String, message: String },
}

pub type EvalResult<T> = Result<T, EvalError>;

/// Source of operand values.
///
/// `Ok(None)` means the key is unknown, which makes the comparison false.
/// `Err` is a fault in the source itself.
pub trait ValueResolver {
    fn resolve(&self, key: &str) -> EvalResult<Option<Value>>;
}

impl<F> ValueResolver for F
where
    F: Fn(&str) -> Option<Value>,
{
    fn resolve(&self, key: &str) -> EvalResult<Option<Value>> {
        Ok(self(key))
    }
}

/// Evaluates conditions against a [`ValueResolver`].
///
/// Operands are resolved left to right and lazily: a comparison whose left
/// side is unknown never resolves its right side, and `AND`/`OR`
/// short-circuit so the rest of a chain is not touched once the result is
/// decided.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluates a compiled condition. Faults degrade to `false`.
    pub fn evaluate<R: ValueResolver + ?Sized>(&self, condition: &Condition, resolver: &R) -> bool {
        self.try_evaluate(condition, resolver)
            .unwrap_or_else(|error| {
                warn!(%error, "condition evaluation failed");
                false
            })
    }

    pub fn try_evaluate<R: ValueResolver + ?Sized>(
        &self,
        condition: &Condition,
        resolver: &R,
    ) -> EvalResult<bool> {
        match condition {
            Condition::Always => Ok(true),
            Condition::Comparison { left, op, right } => {
                self.compare_operands(left, *op, right, resolver)
            }
            Condition::And(left, right) => {
                Ok(self.try_evaluate(left, resolver)? && self.try_evaluate(right, resolver)?)
            }
            Condition::Or(left, right) => {
                Ok(self.try_evaluate(left, resolver)? || self.try_evaluate(right, resolver)?)
            }
        }
    }

    /// Evaluates an uncompiled chain record, walking `next` links in order.
    /// Faults degrade to `false`.
    pub fn evaluate_expression<R: ValueResolver + ?Sized>(
        &self,
        expression: &ConditionExpression,
        resolver: &R,
    ) -> bool {
        self.try_evaluate_expression(expression, resolver)
            .unwrap_or_else(|error| {
                warn!(%error, %expression, "condition evaluation failed");
                false
            })
    }

    pub fn try_evaluate_expression<R: ValueResolver + ?Sized>(
        &self,
        expression: &ConditionExpression,
        resolver: &R,
    ) -> EvalResult<bool> {
        let first = self.compare_operands(
            &expression.left_operand,
            expression.operator,
            &expression.right_operand,
            resolver,
        )?;
        match &expression.chain {
            None => Ok(first),
            Some(chain) => match chain.operator {
                LogicalOperator::And if !first => Ok(false),
                LogicalOperator::Or if first => Ok(true),
                _ => self.try_evaluate_expression(&chain.next, resolver),
            },
        }
    }

    fn compare_operands<R: ValueResolver + ?Sized>(
        &self,
        left: &Operand,
        op: ComparisonOperator,
        right: &Operand,
        resolver: &R,
    ) -> EvalResult<bool> {
        let Some(left_value) = resolve_operand(left, resolver)? else {
            debug!(operand = %left, "left operand unresolved");
            return Ok(false);
        };
        let Some(right_value) = resolve_operand(right, resolver)? else {
            debug!(operand = %right, "right operand unresolved");
            return Ok(false);
        };
        let result = compare(&left_value, op, &right_value);
        debug!(%left_value, %op, %right_value, result, "compared");
        Ok(result)
    }
}

fn resolve_operand<R: ValueResolver + ?Sized>(
    operand: &Operand,
    resolver: &R,
) -> EvalResult<Option<Value>> {
    match operand {
        Operand::Literal(value) => Ok(Some(value.clone())),
        Operand::Reference(key) => resolver.resolve(key),
    }
}

/// Applies one comparison operator to two resolved values.
///
/// A null on either side is always `false`. Ordering operators need both
/// sides to be numeric; the text operators compare string forms.
pub fn compare(left: &Value, op: ComparisonOperator, right: &Value) -> bool {
    if left.is_null() || right.is_null() {
        return false;
    }
    match op {
        ComparisonOperator::Equal => left.loosely_equals(right),
        ComparisonOperator::NotEqual => !left.loosely_equals(right),
        ComparisonOperator::GreaterThan
        | ComparisonOperator::GreaterThanOrEqual
        | ComparisonOperator::LessThan
        | ComparisonOperator::LessThanOrEqual => {
            let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
                return false;
            };
            match op {
                ComparisonOperator::GreaterThan => l > r,
                ComparisonOperator::GreaterThanOrEqual => l >= r,
                ComparisonOperator::LessThan => l < r,
                _ => l <= r,
            }
        }
        ComparisonOperator::Contains => left.to_string().contains(&right.to_string()),
        ComparisonOperator::StartsWith => left.to_string().starts_with(&right.to_string()),
        ComparisonOperator::EndsWith => left.to_string().ends_with(&right.to_string()),
    }
}
