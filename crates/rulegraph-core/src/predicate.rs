//! Predicate and value-match definitions
//!
//! These are pure data. Evaluation lives in `rulegraph-automation`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison applied to a single value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ValueMatch {
    Equals { value: Value },
    NotEquals { value: Value },
    Above { value: f64 },
    Below { value: f64 },
    /// Inclusive on both ends
    Between { min: f64, max: f64 },
    OneOf { values: Vec<Value> },
}

impl ValueMatch {
    /// Test a value against this match.
    ///
    /// Numeric comparisons accept JSON numbers and numeric strings; anything
    /// else never matches. Equality treats `"40"` and `40` as equal.
    pub fn matches(&self, actual: &Value) -> bool {
        match self {
            ValueMatch::Equals { value } => loose_eq(actual, value),
            ValueMatch::NotEquals { value } => !loose_eq(actual, value),
            ValueMatch::Above { value } => as_number(actual).is_some_and(|n| n > *value),
            ValueMatch::Below { value } => as_number(actual).is_some_and(|n| n < *value),
            ValueMatch::Between { min, max } => {
                as_number(actual).is_some_and(|n| n >= *min && n <= *max)
            }
            ValueMatch::OneOf { values } => values.iter().any(|v| loose_eq(actual, v)),
        }
    }
}

/// How a device trigger matches incoming telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TriggerMatch {
    Keyword(TriggerKeyword),
    Value(ValueMatch),
}

/// Keyword forms of [`TriggerMatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKeyword {
    /// Every report fires
    Any,
    /// Fires when the value differs from the previous report
    Changed,
}

impl Default for TriggerMatch {
    fn default() -> Self {
        TriggerMatch::Keyword(TriggerKeyword::Changed)
    }
}

/// Boolean expression used by Condition, Decision and Logic nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// Local time of day window, `"HH:MM"` or `"HH:MM:SS"`.
    /// Wraps past midnight when `after` is later than `before`.
    TimeRange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<String>,
        /// Lowercase three-letter weekday names; empty means every day
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        weekdays: Vec<String>,
    },

    /// Current value of a device parameter
    DeviceState {
        device_id: String,
        parameter: String,
        #[serde(rename = "match")]
        matches: ValueMatch,
    },

    /// Dotted path into the run context (`trigger.value`, `vars.occupied`)
    Variable {
        name: String,
        #[serde(rename = "match")]
        matches: ValueMatch,
    },

    /// Placeholder template rendered then tested for truthiness
    Template { value_template: String },

    And { conditions: Vec<Predicate> },
    Or { conditions: Vec<Predicate> },
    Not { condition: Box<Predicate> },
    Constant { value: bool },
}

impl Predicate {
    pub fn and(conditions: Vec<Predicate>) -> Self {
        Predicate::And { conditions }
    }

    pub fn or(conditions: Vec<Predicate>) -> Self {
        Predicate::Or { conditions }
    }

    pub fn not(condition: Predicate) -> Self {
        Predicate::Not {
            condition: Box::new(condition),
        }
    }

    /// Time window between two `HH:MM` strings
    pub fn time_between(after: impl Into<String>, before: impl Into<String>) -> Self {
        Predicate::TimeRange {
            after: Some(after.into()),
            before: Some(before.into()),
            weekdays: Vec::new(),
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::String(s), other) | (other, Value::String(s)) => match other {
            Value::Number(_) => as_number(other) == s.trim().parse().ok(),
            Value::Bool(flag) => s.eq_ignore_ascii_case(if *flag { "true" } else { "false" }),
            _ => false,
        },
        (Value::Number(_), Value::Number(_)) => as_number(a) == as_number(b),
        _ => false,
    }
}
