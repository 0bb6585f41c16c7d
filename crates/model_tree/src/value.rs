//! Data values stored in a model tree

use crate::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The kind of a value, used for type checks and error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Boolean,
    Number,
    String,
    Date,
    Array,
    Object,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Date => "date",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        };
        f.write_str(name)
    }
}

/// Payload of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Date(DateTime<Utc>),
    Array(Vec<DataValue>),
    Object(BTreeMap<String, DataValue>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Date(_) => ValueKind::Date,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }
}

/// A node of the model tree: a value plus its stable identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValue {
    pub id: NodeId,
    pub value: Value,
}

impl DataValue {
    /// Create a value node with an explicit id
    pub fn with_id(id: NodeId, value: Value) -> Self {
        Self { id, value }
    }

    /// Create a value node with a fresh id
    pub fn new(value: Value) -> Self {
        Self::with_id(NodeId::new(), value)
    }

    pub fn null() -> Self {
        Self::new(Value::Null)
    }

    pub fn boolean(value: bool) -> Self {
        Self::new(Value::Boolean(value))
    }

    pub fn number(value: f64) -> Self {
        Self::new(Value::Number(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new(Value::String(value.into()))
    }

    pub fn date(value: DateTime<Utc>) -> Self {
        Self::new(Value::Date(value))
    }

    pub fn array(values: impl IntoIterator<Item = DataValue>) -> Self {
        Self::new(Value::Array(values.into_iter().collect()))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, DataValue)>) -> Self {
        Self::new(Value::Object(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn kind(&self) -> ValueKind {
        self.value.kind()
    }

    /// Build a value tree from plain JSON, assigning fresh ids to every node.
    ///
    /// JSON has no date type, so dates never come out of this conversion.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let value = match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(DataValue::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), DataValue::from_json(v)))
                    .collect(),
            ),
        };
        Self::new(value)
    }

    /// Render as plain JSON, dropping node ids. Dates become RFC 3339 strings.
    pub fn to_json(&self) -> serde_json::Value {
        match &self.value {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(d) => serde_json::Value::String(d.to_rfc3339()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(DataValue::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Depth-first search for a node by id, including this node
    pub fn find(&self, id: NodeId) -> Option<&DataValue> {
        if self.id == id {
            return Some(self);
        }
        match &self.value {
            Value::Array(items) => items.iter().find_map(|child| child.find(id)),
            Value::Object(map) => map.values().find_map(|child| child.find(id)),
            _ => None,
        }
    }

    /// Mutable variant of [`DataValue::find`]
    pub fn find_mut(&mut self, id: NodeId) -> Option<&mut DataValue> {
        if self.id == id {
            return Some(self);
        }
        match &mut self.value {
            Value::Array(items) => items.iter_mut().find_map(|child| child.find_mut(id)),
            Value::Object(map) => map.values_mut().find_map(|child| child.find_mut(id)),
            _ => None,
        }
    }

    /// Number of nodes in this subtree
    pub fn node_count(&self) -> usize {
        1 + match &self.value {
            Value::Array(items) => items.iter().map(DataValue::node_count).sum(),
            Value::Object(map) => map.values().map(DataValue::node_count).sum(),
            _ => 0,
        }
    }
}
