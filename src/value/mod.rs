use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// The declared kind of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Real,
    Boolean,
    Instant,
}

impl FieldKind {
    /// Wire code for this kind (see the codec module).
    pub fn code(self) -> u8 {
        match self {
            FieldKind::Text => 0,
            FieldKind::Real => 1,
            FieldKind::Boolean => 2,
            FieldKind::Instant => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<FieldKind> {
        match code {
            0 => Some(FieldKind::Text),
            1 => Some(FieldKind::Real),
            2 => Some(FieldKind::Boolean),
            3 => Some(FieldKind::Instant),
            _ => None,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Text => write!(f, "text"),
            FieldKind::Real => write!(f, "real"),
            FieldKind::Boolean => write!(f, "boolean"),
            FieldKind::Instant => write!(f, "instant"),
        }
    }
}

/// A field value. The engine models all record data as this closed union;
/// the codec and comparators switch on the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Real(f64),
    Text(String),
    Instant(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The kind this value inhabits. Null inhabits none.
    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(FieldKind::Boolean),
            Value::Real(_) => Some(FieldKind::Real),
            Value::Text(_) => Some(FieldKind::Text),
            Value::Instant(_) => Some(FieldKind::Instant),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Instant(_) => "instant",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Instant(t) => Some(*t),
            _ => None,
        }
    }

    /// Total order over all values: rank by tag first, then natural order
    /// within a kind. Reals use IEEE total ordering, instants compare by
    /// epoch milliseconds. Callers are expected to compare values of one
    /// kind; the cross-kind order exists so index keys stay well-founded.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Boolean(_) => 1,
                Value::Real(_) => 2,
                Value::Text(_) => 3,
                Value::Instant(_) => 4,
            }
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Real(a), Value::Real(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Instant(a), Value::Instant(b)) => {
                a.timestamp_millis().cmp(&b.timestamp_millis())
            }
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Instant(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Real(v as f64)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Real(v as f64)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Instant(v)
    }
}

/// A record's field assignment. `BTreeMap` keeps field order deterministic
/// for the codec and for byte-identical re-commits.
pub type Fields = BTreeMap<String, Value>;

/// A stored record: a unique id plus its field assignment.
///
/// Records handed out by query operations are independent snapshots; mutating
/// one does not touch the stored copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub fields: Fields,
}

impl Record {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Record {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}
