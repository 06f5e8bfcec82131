use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::key::Key;
use crate::node::Node;
use crate::value::Value;

/// Serialized form of a node in the embedded store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node id.
    pub id: String,
    /// Node name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Prototype name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prototype: Option<String>,
    /// Parent key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Key>,
    /// Creation time (ms since epoch).
    pub created: i64,
    /// Last modification time (ms since epoch).
    pub last_modified: i64,
    /// Whether the node is reached from its parent by id.
    #[serde(default)]
    pub anonymous: bool,
    /// Child keys in order.
    #[serde(default)]
    pub subnodes: Vec<Key>,
    /// Property values.
    #[serde(default)]
    pub properties: BTreeMap<String, RecordValue>,
}

/// Serialized property value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RecordValue {
    /// String.
    Str(String),
    /// Boolean.
    Bool(bool),
    /// Milliseconds since the epoch.
    Date(i64),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Key of the referenced node.
    Node(Key),
    /// Opaque bytes.
    Opaque(Vec<u8>),
}

impl RecordValue {
    /// Record form of `value`; node references must point at keyed nodes.
    pub fn from_value(name: &str, value: &Value) -> Result<Self> {
        Ok(match value {
            Value::Str(s) => RecordValue::Str(s.clone()),
            Value::Bool(b) => RecordValue::Bool(*b),
            Value::Date(ms) => RecordValue::Date(*ms),
            Value::Int(i) => RecordValue::Int(*i),
            Value::Float(f) if f.is_finite() => RecordValue::Float(*f),
            Value::Float(_) => {
                return Err(StoreError::TypeMismatch {
                    property: name.to_owned(),
                    expected: "a finite number",
                })
            }
            Value::Opaque(bytes) => RecordValue::Opaque(bytes.clone()),
            Value::Node(handle) => match handle.key() {
                Some(key) => RecordValue::Node(key),
                None => {
                    return Err(StoreError::TypeMismatch {
                        property: name.to_owned(),
                        expected: "a reference to a persisted node",
                    })
                }
            },
        })
    }

    /// In-memory value.
    pub fn into_value(self) -> Value {
        match self {
            RecordValue::Str(s) => Value::Str(s),
            RecordValue::Bool(b) => Value::Bool(b),
            RecordValue::Date(ms) => Value::Date(ms),
            RecordValue::Int(i) => Value::Int(i),
            RecordValue::Float(f) => Value::Float(f),
            RecordValue::Opaque(bytes) => Value::Opaque(bytes),
            RecordValue::Node(key) => Value::Node(key.into()),
        }
    }
}

impl NodeRecord {
    /// Snapshot of a keyed node.
    pub fn from_node(node: &Node) -> Result<Self> {
        let mut properties = BTreeMap::new();
        for prop in node.properties() {
            properties.insert(
                prop.name().to_owned(),
                RecordValue::from_value(prop.name(), prop.value())?,
            );
        }
        let subnodes = node
            .subnodes()
            .map(|list| list.handles().iter().filter_map(|h| h.key()).collect())
            .unwrap_or_default();
        Ok(Self {
            id: node.id().to_owned(),
            name: node.name().map(str::to_owned),
            prototype: node.prototype().map(str::to_owned),
            parent: node.parent().and_then(|h| h.key()),
            created: node.created(),
            last_modified: node.last_modified(),
            anonymous: node.is_anonymous(),
            subnodes,
            properties,
        })
    }

    /// JSON encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a JSON record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
