use std::cmp::Ordering;
use std::fmt;

use crate::handle::NodeHandle;

/// Typed content of a property cell.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// UTF-8 string.
    Str(String),
    /// Boolean flag.
    Bool(bool),
    /// Point in time as milliseconds since the Unix epoch.
    Date(i64),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point number.
    Float(f64),
    /// Reference to another node.
    Node(NodeHandle),
    /// Opaque payload owned by the application layer.
    Opaque(Vec<u8>),
}

/// Type tag of a [`Value`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    /// [`Value::Str`]
    Str,
    /// [`Value::Bool`]
    Bool,
    /// [`Value::Date`]
    Date,
    /// [`Value::Int`]
    Int,
    /// [`Value::Float`]
    Float,
    /// [`Value::Node`]
    Node,
    /// [`Value::Opaque`]
    Opaque,
}

impl Value {
    /// Type tag of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Str(_) => ValueKind::Str,
            Value::Bool(_) => ValueKind::Bool,
            Value::Date(_) => ValueKind::Date,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Node(_) => ValueKind::Node,
            Value::Opaque(_) => ValueKind::Opaque,
        }
    }

    /// String slice for string values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, converting floats by truncation.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) | Value::Date(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            Value::Bool(v) => Some(i64::from(*v)),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Node handle for node references.
    pub fn as_node(&self) -> Option<&NodeHandle> {
        match self {
            Value::Node(h) => Some(h),
            _ => None,
        }
    }

    /// Textual form used for keys, group names and text columns.
    pub fn to_text(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Bool(v) => v.to_string(),
            Value::Date(v) | Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Node(h) => h.key().map(|k| k.id().to_owned()).unwrap_or_default(),
            Value::Opaque(bytes) => format!("opaque(len={})", bytes.len()),
        }
    }

    /// Ordering used for sorted subnode lists.
    ///
    /// Numbers compare numerically across integer, float and date values,
    /// strings lexicographically; mixed kinds fall back to their text form.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (a, b) => match (a.numeric(), b.numeric()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => a.to_text().cmp(&b.to_text()),
            },
        }
    }

    fn numeric(&self) -> Option<f64> {
        match self {
            Value::Int(v) | Value::Date(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Node(h) => write!(f, "{h:?}"),
            Value::Date(ms) => write!(f, "date({ms})"),
            other => f.write_str(&other.to_text()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<NodeHandle> for Value {
    fn from(value: NodeHandle) -> Self {
        Value::Node(value)
    }
}

/// A named value cell owned by one node.
#[derive(Clone, Debug, PartialEq)]
pub struct Property {
    name: String,
    value: Value,
    dirty: bool,
}

impl Property {
    /// Cell whose value differs from the persisted state.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            dirty: true,
        }
    }

    /// Cell freshly loaded from a backend.
    pub fn loaded(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            dirty: false,
        }
    }

    /// Property name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Whether the value has changed since it was last persisted.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Replaces the value, marking the cell dirty if it changed.
    pub fn set(&mut self, value: Value) -> bool {
        if self.value == value {
            return false;
        }
        self.value = value;
        self.dirty = true;
        true
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }
}
