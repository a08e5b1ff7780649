//! Record types flowing through a synchronization run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw record as returned by a source system.
///
/// Lives for one page only; it is dropped once transformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Source-native identifier, read from the configured id field.
    pub id: Option<String>,
    /// Raw field values.
    pub fields: Map<String, Value>,
}

impl SourceRecord {
    /// Build a record from a raw JSON item, reading the id from `id_field`.
    ///
    /// Non-object items become a record with a single `value` field.
    pub fn from_json(item: Value, id_field: &str) -> Self {
        let fields = match item {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let id = fields.get(id_field).and_then(value_as_key);
        Self { id, fields }
    }

    /// Get a raw field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Identifier for log lines.
    pub fn display_id(&self) -> &str {
        self.id.as_deref().unwrap_or("<no id>")
    }
}

/// Target-shaped record produced by the transformation engine.
///
/// Fields are kept in a `BTreeMap` so that serialization is byte-stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedRecord {
    /// Target object type tag (e.g. `contacts`, `campaigns`).
    pub object_type: String,
    /// Target field name to value.
    pub fields: BTreeMap<String, Value>,
}

impl TransformedRecord {
    /// Create an empty record for an object type.
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Non-empty string form of a field, used for natural keys and lookups.
    pub fn key_value(&self, field: &str) -> Option<String> {
        self.fields.get(field).and_then(value_as_key)
    }

    /// Fields as a JSON object, ready to send as target properties.
    pub fn to_properties(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Entity persisted in the target system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    /// Target-assigned identifier.
    pub id: String,
    /// Object type the record belongs to.
    pub object_type: String,
    /// Stored properties (may be partial, depending on the lookup).
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Typed, directed relationship between two target entities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssociationEdge {
    pub from_type: String,
    pub from_id: String,
    pub to_type: String,
    pub to_id: String,
    pub association_type_id: u32,
}

/// Render a JSON value as a lookup key. Empty strings, nulls and
/// structured values have no key form.
pub fn value_as_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
