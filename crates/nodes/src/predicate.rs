//! Field predicates evaluated against JSON step results.
//!
//! Used in two places: the `condition` node type evaluates one against its
//! upstream results, and edges carry an optional [`EdgeCondition`] evaluated
//! against the source node's output to decide whether the edge fires.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator of a [`Predicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// String contains substring, array contains element, object contains key.
    Contains,
    /// Field is present and not null.
    Exists,
    /// Field is present and truthy (non-empty, non-zero, `true`).
    Truthy,
}

impl Operator {
    /// Whether the operator compares against `value`.
    pub fn needs_value(self) -> bool {
        !matches!(self, Self::Exists | Self::Truthy)
    }
}

/// `field <op> value`, e.g. `{"field": "status", "op": "eq", "value": 200}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// Dotted path into the evaluated document (`body.items.0.id`).
    pub field: String,
    pub op: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Predicate {
    pub fn new(field: impl Into<String>, op: Operator, value: Option<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// First path segment; the top-level field the predicate depends on.
    pub fn root_field(&self) -> &str {
        self.field.split('.').next().unwrap_or_default()
    }

    /// Evaluate against `doc`. Missing fields and type mismatches yield `false`.
    pub fn evaluate(&self, doc: &Value) -> bool {
        let actual = lookup(doc, &self.field);

        match self.op {
            Operator::Exists => actual.is_some_and(|v| !v.is_null()),
            Operator::Truthy => actual.is_some_and(is_truthy),
            Operator::Eq => match (actual, &self.value) {
                (Some(a), Some(b)) => loosely_equal(a, b),
                (None, Some(Value::Null)) | (None, None) => true,
                _ => false,
            },
            Operator::Ne => match (actual, &self.value) {
                (Some(a), Some(b)) => !loosely_equal(a, b),
                (None, Some(Value::Null)) | (None, None) => false,
                _ => true,
            },
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                let (Some(a), Some(b)) = (actual, self.value.as_ref()) else {
                    return false;
                };
                match compare(a, b) {
                    Some(ordering) => match self.op {
                        Operator::Gt => ordering.is_gt(),
                        Operator::Gte => ordering.is_ge(),
                        Operator::Lt => ordering.is_lt(),
                        _ => ordering.is_le(),
                    },
                    None => false,
                }
            }
            Operator::Contains => {
                let (Some(a), Some(b)) = (actual, self.value.as_ref()) else {
                    return false;
                };
                match (a, b) {
                    (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
                    (Value::Array(items), needle) => items.iter().any(|item| loosely_equal(item, needle)),
                    (Value::Object(map), Value::String(key)) => map.contains_key(key),
                    _ => false,
                }
            }
        }
    }
}

/// Condition attached to an edge.
///
/// A bare boolean is shorthand for `{"field": "result", "op": "eq", "value": <bool>}`,
/// which is how branches out of a `condition` node are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EdgeCondition {
    Branch(bool),
    Predicate(Predicate),
}

impl EdgeCondition {
    /// Field on the source node's output the condition reads.
    pub fn root_field(&self) -> &str {
        match self {
            Self::Branch(_) => "result",
            Self::Predicate(p) => p.root_field(),
        }
    }

    pub fn evaluate(&self, output: &Value) -> bool {
        match self {
            Self::Branch(expected) => output.get("result").and_then(Value::as_bool) == Some(*expected),
            Self::Predicate(p) => p.evaluate(output),
        }
    }
}

/// Resolve a dotted path. Numeric segments index into arrays.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(doc);
    }
    path.split('.').try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

// Numbers compare by value so `200` equals `200.0`.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
