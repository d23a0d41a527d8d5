//! Condition evaluation — decides whether a transition's guard holds for a
//! record's current field values.
//!
//! Evaluation is pure and total: a field missing from the snapshot compares as
//! `null`, and an operator the evaluator does not know fails the condition
//! closed (it is reported in the [`Evaluation`] and logged, never treated as
//! true).

use std::cmp::Ordering;
use std::str::FromStr;

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::models::{Condition, LogicalOperator, Operand};
use crate::record::FieldSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    IsEmpty,
    IsNotEmpty,
}

impl FromStr for ConditionOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "equals" | "eq" => Self::Equals,
            "not_equals" | "ne" => Self::NotEquals,
            "greater_than" | "gt" => Self::GreaterThan,
            "less_than" | "lt" => Self::LessThan,
            "greater_than_or_equal" | "gte" => Self::GreaterThanOrEqual,
            "less_than_or_equal" | "lte" => Self::LessThanOrEqual,
            "contains" => Self::Contains,
            "not_contains" => Self::NotContains,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "is_empty" => Self::IsEmpty,
            "is_not_empty" => Self::IsNotEmpty,
            other => return Err(format!("unknown condition operator '{other}'")),
        })
    }
}

/// Outcome of evaluating a condition list, with enough detail to explain a "no".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub passed: bool,
    /// Conditions that evaluated false (including unknown-operator ones).
    pub failed: Vec<Uuid>,
    /// Conditions whose operator could not be parsed.
    pub invalid: Vec<Uuid>,
}

/// Evaluate `conditions` against `record` combined by `logic`.
///
/// An empty list always passes.
pub fn evaluate(conditions: &[Condition], logic: LogicalOperator, record: &FieldSnapshot) -> Evaluation {
    let mut eval = Evaluation::default();
    if conditions.is_empty() {
        eval.passed = true;
        return eval;
    }

    let mut any_true = false;
    for condition in conditions {
        match evaluate_one(condition, record) {
            Ok(true) => any_true = true,
            Ok(false) => eval.failed.push(condition.id),
            Err(msg) => {
                warn!(condition_id = %condition.id, "condition failed closed: {}", msg);
                eval.invalid.push(condition.id);
                eval.failed.push(condition.id);
            }
        }
    }

    eval.passed = match logic {
        LogicalOperator::And => eval.failed.is_empty(),
        LogicalOperator::Or => any_true,
    };
    eval
}

/// Convenience wrapper when only the boolean matters.
pub fn passes(conditions: &[Condition], logic: LogicalOperator, record: &FieldSnapshot) -> bool {
    evaluate(conditions, logic, record).passed
}

/// Evaluate one condition. `Err` only for an unknown operator.
pub fn evaluate_one(condition: &Condition, record: &FieldSnapshot) -> Result<bool, String> {
    let op = ConditionOperator::from_str(&condition.operator)?;
    let left = record.get(&condition.field).unwrap_or(&Value::Null);
    let right = match &condition.operand {
        Operand::Value(v) => v,
        Operand::FieldValue(other) => record.get(other).unwrap_or(&Value::Null),
    };
    Ok(apply(op, left, right))
}

fn apply(op: ConditionOperator, left: &Value, right: &Value) -> bool {
    use ConditionOperator::*;

    match op {
        Equals => loosely_equal(left, right),
        NotEquals => !loosely_equal(left, right),
        GreaterThan => compare(left, right) == Some(Ordering::Greater),
        LessThan => compare(left, right) == Some(Ordering::Less),
        GreaterThanOrEqual => matches!(compare(left, right), Some(Ordering::Greater | Ordering::Equal)),
        LessThanOrEqual => matches!(compare(left, right), Some(Ordering::Less | Ordering::Equal)),
        Contains => contains(left, right),
        NotContains => !contains(left, right),
        StartsWith => match (left.as_str(), as_text(right)) {
            (Some(l), Some(r)) => l.to_lowercase().starts_with(&r.to_lowercase()),
            _ => false,
        },
        EndsWith => match (left.as_str(), as_text(right)) {
            (Some(l), Some(r)) => l.to_lowercase().ends_with(&r.to_lowercase()),
            _ => false,
        },
        In => member_of(left, right),
        NotIn => !member_of(left, right),
        IsEmpty => is_empty(left),
        IsNotEmpty => !is_empty(left),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Equality that tolerates the usual form-data mismatches (`"5"` vs `5`).
fn loosely_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => (l - r).abs() < f64::EPSILON,
        _ => match (left, right) {
            (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
                s.eq_ignore_ascii_case(&b.to_string())
            }
            _ => false,
        },
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    if left.is_null() || right.is_null() {
        return None;
    }
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        // ISO-8601 dates and plain strings order lexicographically.
        _ => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => Some(l.cmp(r)),
            _ => None,
        },
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => as_text(needle)
            .map(|n| s.to_lowercase().contains(&n.to_lowercase()))
            .unwrap_or(false),
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        _ => false,
    }
}

fn member_of(value: &Value, set: &Value) -> bool {
    match set {
        Value::Array(items) => items.iter().any(|item| loosely_equal(value, item)),
        // Comma separated lists as typed into an authoring form.
        Value::String(s) => match as_text(value) {
            Some(v) => s.split(',').any(|part| part.trim() == v),
            None => false,
        },
        _ => false,
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
