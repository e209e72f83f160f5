//! # Judgment context
//!
//! Everything one decision cycle knows: the recognition results of every
//! sense operation plus named variables. A context is built once per cycle,
//! every field is written at most once, and it is then only read through
//! [`ValueResolver`].
//!
//! Key namespace:
//!
//! | key                                  | value                                  |
//! |--------------------------------------|----------------------------------------|
//! | `variable.<name>` / `<name>`         | the variable                           |
//! | `recognition.<Op>.Success`           | any result of `<Op>` succeeded         |
//! | `recognition.<Op>.Status`            | `"Success"` or `"Failure"`             |
//! | `recognition.<Op>.Confidence`        | confidence of the best result          |
//! | `recognition.<Op>.Template`          | template of the best result            |
//! | `recognition.<Op>.Count`             | number of successful results           |
//! | `recognition.<Op>.X/Y/Width/Height`  | region of the best result              |
//! | `recognition.*.<Field>`              | `Success`, `Confidence`, `Count` over every operation |
//!
//! The best result is the most confident successful one, falling back to the
//! most confident result when nothing succeeded. `Confidence`, `Template` and
//! the region fields all describe that same result.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

use crate::condition::{EvalResult, Value, ValueResolver};
use crate::hal::Region;
use crate::timestamp::Timestamp;

const RECOGNITION_PREFIX: &str = "recognition.";
const VARIABLE_PREFIX: &str = "variable.";
const ANY_OPERATION: &str = "*";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContextError {
    #[error("Context field {key} is already set")]
    AlreadySet { key: String },
}

/// Outcome of matching one template against one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub success: bool,
    pub confidence: f64,
    #[serde(default)]
    pub region: Option<Region>,
    pub template_name: String,
}

impl RecognitionResult {
    /// Confidence is clamped into `[0, 1]`; NaN becomes 0.
    pub fn new(template_name: impl Into<String>, success: bool, confidence: f64) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            success,
            confidence,
            region: None,
            template_name: template_name.into(),
        }
    }

    pub fn failed(template_name: impl Into<String>) -> Self {
        Self::new(template_name, false, 0.0)
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }
}

/// Recognition results of one named sense operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenseResult {
    pub operation: String,
    pub results: Vec<RecognitionResult>,
    pub captured_at: Timestamp,
}

impl SenseResult {
    pub fn new(operation: impl Into<String>, results: Vec<RecognitionResult>) -> Self {
        Self {
            operation: operation.into(),
            results,
            captured_at: Timestamp::now(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.results.iter().any(|r| r.success)
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    /// Highest-confidence successful result, or the highest-confidence result
    /// at all when nothing succeeded.
    pub fn best(&self) -> Option<&RecognitionResult> {
        let by_confidence =
            |a: &&RecognitionResult, b: &&RecognitionResult| a.confidence.total_cmp(&b.confidence);
        self.results
            .iter()
            .filter(|r| r.success)
            .max_by(by_confidence)
            .or_else(|| self.results.iter().max_by(by_confidence))
    }

    pub fn max_confidence(&self) -> Option<f64> {
        self.results.iter().map(|r| r.confidence).reduce(f64::max)
    }

    fn field(&self, field: &str) -> Option<Value> {
        let best = self.best();
        let region = best.and_then(|r| r.region);
        match_field(field, |f| match f {
            Field::Success => Some(Value::Boolean(self.succeeded())),
            Field::Status => Some(Value::from(if self.succeeded() { "Success" } else { "Failure" })),
            Field::Confidence => best.map(|r| Value::Float(r.confidence)),
            Field::Template => best.map(|r| Value::from(r.template_name.as_str())),
            Field::Count => Some(Value::from(self.success_count())),
            Field::X => region.map(|r| Value::from(r.x)),
            Field::Y => region.map(|r| Value::from(r.y)),
            Field::Width => region.map(|r| Value::from(r.width)),
            Field::Height => region.map(|r| Value::from(r.height)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString)]
#[strum(ascii_case_insensitive)]
enum Field {
    Success,
    Status,
    Confidence,
    Template,
    Count,
    X,
    Y,
    Width,
    Height,
}

fn match_field(field: &str, read: impl FnOnce(Field) -> Option<Value>) -> Option<Value> {
    field.parse::<Field>().ok().and_then(read)
}

/// Per-cycle aggregate of recognition results and variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentContext {
    pub id: Uuid,
    pub created_at: Timestamp,
    sense_results: HashMap<String, SenseResult>,
    variables: HashMap<String, Value>,
}

impl Default for JudgmentContext {
    fn default() -> Self {
        Self::new()
    }
}

impl JudgmentContext {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Timestamp::now(),
            sense_results: HashMap::new(),
            variables: HashMap::new(),
        }
    }

    /// Stores the results of one sense operation. Each operation may be
    /// stored once per context.
    pub fn insert_sense_result(&mut self, result: SenseResult) -> Result<(), ContextError> {
        if self.sense_results.contains_key(&result.operation) {
            return Err(ContextError::AlreadySet {
                key: format!("{}{}", RECOGNITION_PREFIX, result.operation),
            });
        }
        self.sense_results.insert(result.operation.clone(), result);
        Ok(())
    }

    /// Sets a variable. Each name may be set once per context. A leading
    /// `variable.` is stripped.
    pub fn set_variable(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), ContextError> {
        let name = name.into();
        let name = name
            .strip_prefix(VARIABLE_PREFIX)
            .map(str::to_string)
            .unwrap_or(name);
        if self.variables.contains_key(&name) {
            return Err(ContextError::AlreadySet {
                key: format!("{}{}", VARIABLE_PREFIX, name),
            });
        }
        self.variables.insert(name, value.into());
        Ok(())
    }

    pub fn sense_result(&self, operation: &str) -> Option<&SenseResult> {
        self.sense_results.get(operation)
    }

    pub fn sense_results(&self) -> impl Iterator<Item = &SenseResult> {
        self.sense_results.values()
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// True when at least one recognition of any operation succeeded.
    pub fn any_recognition_succeeded(&self) -> bool {
        self.sense_results.values().any(SenseResult::succeeded)
    }

    /// Reads `key` according to the context key namespace.
    pub fn lookup(&self, key: &str) -> Option<Value> {
        if let Some(name) = key.strip_prefix(VARIABLE_PREFIX) {
            return self.variables.get(name).cloned();
        }
        if let Some(path) = key.strip_prefix(RECOGNITION_PREFIX) {
            let (operation, field) = path.rsplit_once('.')?;
            if operation == ANY_OPERATION {
                return self.aggregate(field);
            }
            return self.sense_results.get(operation)?.field(field);
        }
        self.variables.get(key).cloned()
    }

    fn aggregate(&self, field: &str) -> Option<Value> {
        match_field(field, |f| match f {
            Field::Success => Some(Value::Boolean(self.any_recognition_succeeded())),
            Field::Confidence => self
                .sense_results
                .values()
                .filter_map(|sense| sense.best().map(|r| r.confidence))
                .reduce(f64::max)
                .map(Value::Float),
            Field::Count => Some(Value::from(
                self.sense_results
                    .values()
                    .map(SenseResult::success_count)
                    .sum::<usize>(),
            )),
            _ => None,
        })
    }
}

impl ValueResolver for JudgmentContext {
    fn resolve(&self, key: &str) -> EvalResult<Option<Value>> {
        let value = self.lookup(key);
        trace!(context = %self.id, key, ?value, "resolved");
        Ok(value)
    }
}
