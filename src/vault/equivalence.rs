//! Desired-vs-observed payload comparison
//!
//! Vault echoes objects back in its own representation: TTLs as integer
//! seconds, omitted lists instead of empty ones, and extra server-computed
//! fields. Both sides are canonicalized field by field before a structural
//! comparison, and only the fields the desired payload declares take part.

use serde_json::{Map, Value};

use super::duration::canonical_seconds;
use super::Payload;

/// How a declared field is canonicalized before comparison
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// Compared as-is after number normalization
    Scalar,
    /// Normalized to whole seconds
    Duration,
    /// Ordered list
    List,
    /// Order- and duplicate-insensitive list
    Set,
}

/// Per-kind description of payload fields that need special canonicalization
#[derive(Debug)]
pub struct PayloadShape {
    fields: &'static [(&'static str, FieldKind)],
}

impl PayloadShape {
    pub const fn new(fields: &'static [(&'static str, FieldKind)]) -> Self {
        Self { fields }
    }

    /// Fields not listed are treated as scalars
    pub fn kind_of(&self, field: &str) -> FieldKind {
        self.fields
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, kind)| *kind)
            .unwrap_or(FieldKind::Scalar)
    }
}

/// True when the observed remote object already matches the desired payload
///
/// An absent remote object is never equivalent, which forces a create.
pub fn is_equivalent(desired: &Payload, observed: Option<&Payload>, shape: &PayloadShape) -> bool {
    let Some(observed) = observed else {
        return false;
    };

    desired.iter().all(|(field, want)| {
        let kind = shape.kind_of(field);
        canonicalize(kind, Some(want)) == canonicalize(kind, observed.get(field))
    })
}

/// Canonical form of a single field value; absent and empty both map to `null`
pub fn canonicalize(kind: FieldKind, value: Option<&Value>) -> Value {
    let Some(value) = value.filter(|v| !is_empty(v)) else {
        return Value::Null;
    };

    match kind {
        FieldKind::Duration => canonical_seconds(value)
            .map(Value::from)
            .unwrap_or_else(|| normalize(value)),
        FieldKind::Set => match value {
            Value::Array(items) => {
                let mut items: Vec<Value> = items.iter().map(normalize).collect();
                items.sort_by_key(|v| v.to_string());
                items.dedup();
                Value::Array(items)
            }
            other => normalize(other),
        },
        FieldKind::List | FieldKind::Scalar => normalize(value),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => {
                Value::from(f as i64)
            }
            _ => Value::Number(n.clone()),
        },
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}
