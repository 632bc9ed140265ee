// Rule conditions - the default predicate language for approval rule matching

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single condition to evaluate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Field name to evaluate (supports dot notation for nested fields)
    pub field: String,
    /// Operator for comparison
    pub operator: ConditionOperator,
    /// Value to compare against
    #[serde(default)]
    pub value: Value,
}

/// Group of conditions with AND/OR logic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    /// Logic operator: "AND" or "OR"
    #[serde(default = "default_logic")]
    pub logic: String,
    /// List of conditions in this group
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Nested condition groups for complex logic
    #[serde(default)]
    pub groups: Vec<ConditionGroup>,
}

fn default_logic() -> String {
    "AND".to_string()
}

/// Condition operators
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    // Equality
    #[serde(alias = "eq", alias = "==")]
    Equals,
    #[serde(alias = "ne", alias = "!=")]
    NotEquals,

    // String operations
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,

    // Numeric comparisons
    #[serde(alias = "gt", alias = ">")]
    GreaterThan,
    #[serde(alias = "gte", alias = ">=")]
    GreaterThanOrEquals,
    #[serde(alias = "lt", alias = "<")]
    LessThan,
    #[serde(alias = "lte", alias = "<=")]
    LessThanOrEquals,

    // Array operations
    In,
    NotIn,

    // Null/Empty checks
    #[serde(alias = "is_empty")]
    IsNull,
    #[serde(alias = "is_not_empty")]
    IsNotNull,

    // Boolean
    IsTrue,
    IsFalse,
}

impl Condition {
    /// Evaluate against a document payload
    pub fn evaluate(&self, payload: &Value) -> bool {
        let field_value = get_nested_value(payload, &self.field);

        match self.operator {
            ConditionOperator::Equals => field_value.map(|v| loosely_equal(v, &self.value)).unwrap_or(false),
            ConditionOperator::NotEquals => field_value.map(|v| !loosely_equal(v, &self.value)).unwrap_or(true),
            ConditionOperator::Contains => {
                string_pair(field_value, &self.value).map(|(s, p)| s.contains(&p)).unwrap_or(false)
            }
            ConditionOperator::NotContains => {
                string_pair(field_value, &self.value).map(|(s, p)| !s.contains(&p)).unwrap_or(true)
            }
            ConditionOperator::StartsWith => {
                string_pair(field_value, &self.value).map(|(s, p)| s.starts_with(&p)).unwrap_or(false)
            }
            ConditionOperator::EndsWith => {
                string_pair(field_value, &self.value).map(|(s, p)| s.ends_with(&p)).unwrap_or(false)
            }
            ConditionOperator::Regex => {
                if let (Some(s), Some(pattern)) = (field_value.and_then(Value::as_str), self.value.as_str()) {
                    if let Ok(re) = regex::Regex::new(pattern) {
                        return re.is_match(s);
                    }
                }
                false
            }
            ConditionOperator::GreaterThan => self.compare(field_value, |a, b| a > b),
            ConditionOperator::GreaterThanOrEquals => self.compare(field_value, |a, b| a >= b),
            ConditionOperator::LessThan => self.compare(field_value, |a, b| a < b),
            ConditionOperator::LessThanOrEquals => self.compare(field_value, |a, b| a <= b),
            ConditionOperator::In => match (field_value, self.value.as_array()) {
                (Some(v), Some(arr)) => arr.iter().any(|candidate| loosely_equal(v, candidate)),
                _ => false,
            },
            ConditionOperator::NotIn => match (field_value, self.value.as_array()) {
                (Some(v), Some(arr)) => !arr.iter().any(|candidate| loosely_equal(v, candidate)),
                _ => true,
            },
            ConditionOperator::IsNull => field_value.map(Value::is_null).unwrap_or(true),
            ConditionOperator::IsNotNull => field_value.map(|v| !v.is_null()).unwrap_or(false),
            ConditionOperator::IsTrue => field_value.and_then(Value::as_bool) == Some(true),
            ConditionOperator::IsFalse => field_value.and_then(Value::as_bool) == Some(false),
        }
    }

    fn compare(&self, field_value: Option<&Value>, op: impl Fn(f64, f64) -> bool) -> bool {
        match (field_value.and_then(as_number), as_number(&self.value)) {
            (Some(v), Some(c)) => op(v, c),
            _ => false,
        }
    }
}

impl ConditionGroup {
    pub fn and(conditions: Vec<Condition>) -> Self {
        Self {
            logic: "AND".to_string(),
            conditions,
            groups: Vec::new(),
        }
    }

    pub fn evaluate(&self, payload: &Value) -> bool {
        let mut results = self
            .conditions
            .iter()
            .map(|c| c.evaluate(payload))
            .chain(self.groups.iter().map(|g| g.evaluate(payload)));

        match self.logic.as_str() {
            "OR" | "or" => results.any(|r| r),
            _ => results.all(|r| r),
        }
    }

    /// Parse persisted rule conditions. A bare array is an AND group.
    pub fn from_json(value: &Value) -> Result<Self, serde_json::Error> {
        match value {
            Value::Array(_) => Ok(Self::and(serde_json::from_value(value.clone())?)),
            _ => serde_json::from_value(value.clone()),
        }
    }
}

fn get_nested_value<'a>(json: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(json, |current, part| current.get(part))
}

/// Numbers arrive both as JSON numbers and as decimal strings
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loosely_equal(field: &Value, expected: &Value) -> bool {
    if field == expected {
        return true;
    }
    match (field, expected) {
        (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        _ => match (as_number(field), as_number(expected)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn string_pair(field_value: Option<&Value>, pattern: &Value) -> Option<(String, String)> {
    let s = field_value?.as_str()?;
    let p = pattern.as_str()?;
    Some((s.to_lowercase(), p.to_lowercase()))
}
