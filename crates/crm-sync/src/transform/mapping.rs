//! Declarative field-mapping tables.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};

/// Target type for [`ValueKind::TypeCoerced`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coercion {
    Integer,
    Number,
    Boolean,
    /// Milliseconds since the Unix epoch.
    EpochMillis,
    /// `YYYY-MM-DD`.
    Date,
    /// RFC 3339 in UTC.
    DateTime,
    String,
}

/// How a source value is turned into a target value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ValueKind {
    /// Copy primitives; structured values become compact JSON.
    #[default]
    Scalar,
    /// Join list elements with `;`.
    ArrayJoin,
    /// Pick one property of a lookup-style object.
    NestedObjectName { property: String },
    /// Walk a dotted path into the value; stored under `target + suffix`.
    NestedJsonPath { path: Vec<String>, suffix: String },
    /// Convert to a specific type.
    TypeCoerced { to: Coercion },
}

/// Wire name of a [`ValueKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum KindName {
    #[default]
    Scalar,
    ArrayJoin,
    NestedObjectName,
    NestedJsonPath,
    TypeCoerced,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMappingEntry {
    target: String,
    #[serde(default)]
    kind: KindName,
    #[serde(default)]
    property: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    suffix: Option<String>,
    #[serde(default)]
    to: Option<Coercion>,
}

/// One source field's mapping.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawMappingEntry")]
pub struct MappingEntry {
    pub target: String,
    pub kind: ValueKind,
}

impl MappingEntry {
    pub fn new(target: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            target: target.into(),
            kind,
        }
    }

    /// Name of the target field this entry writes.
    pub fn stored_field(&self) -> String {
        match &self.kind {
            ValueKind::NestedJsonPath { suffix, .. } => format!("{}{}", self.target, suffix),
            _ => self.target.clone(),
        }
    }
}

impl TryFrom<RawMappingEntry> for MappingEntry {
    type Error = String;

    fn try_from(raw: RawMappingEntry) -> std::result::Result<Self, Self::Error> {
        if raw.target.is_empty() {
            return Err("mapping target must not be empty".to_string());
        }
        let kind = match raw.kind {
            KindName::Scalar => ValueKind::Scalar,
            KindName::ArrayJoin => ValueKind::ArrayJoin,
            KindName::NestedObjectName => ValueKind::NestedObjectName {
                property: raw.property.unwrap_or_else(|| "name".to_string()),
            },
            KindName::NestedJsonPath => {
                let path = raw
                    .path
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| format!("{}: nested_json_path requires 'path'", raw.target))?;
                ValueKind::NestedJsonPath {
                    path: path.split('.').map(str::to_string).collect(),
                    suffix: raw.suffix.unwrap_or_else(|| "name".to_string()),
                }
            }
            KindName::TypeCoerced => ValueKind::TypeCoerced {
                to: raw
                    .to
                    .ok_or_else(|| format!("{}: type_coerced requires 'to'", raw.target))?,
            },
        };
        Ok(Self {
            target: raw.target,
            kind,
        })
    }
}

/// Field-mapping table for one target object type.
///
/// Loaded once and shared read-only by every transform call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MappingTable {
    /// Target object type tag.
    pub object_type: String,

    /// Target field used as the idempotency key.
    pub natural_key: String,

    /// Target field holding the human-readable name.
    #[serde(default)]
    pub display_name_field: Option<String>,

    /// Text prepended to the display name after escaping.
    #[serde(default)]
    pub display_name_prefix: Option<String>,

    /// Static target fields; mapped fields override them.
    #[serde(default)]
    pub constants: BTreeMap<String, Value>,

    /// Source field name to mapping entry.
    pub fields: BTreeMap<String, MappingEntry>,
}

impl MappingTable {
    /// Load a mapping table from a YAML or JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Configuration(format!(
                "cannot read mapping table {}: {}",
                path.display(),
                e
            ))
        })?;
        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
        let table = if is_json {
            Self::from_json(&content)?
        } else {
            Self::from_yaml(&content)?
        };
        Ok(table)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: MappingTable = serde_yaml::from_str(yaml)?;
        table.validate()?;
        Ok(table)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let table: MappingTable = serde_json::from_str(json)?;
        table.validate()?;
        Ok(table)
    }

    /// Check that the table can produce its own natural key.
    pub fn validate(&self) -> Result<()> {
        if self.object_type.is_empty() {
            return Err(SyncError::Configuration(
                "mapping object_type is required".into(),
            ));
        }
        if self.natural_key.is_empty() {
            return Err(SyncError::Configuration(
                "mapping natural_key is required".into(),
            ));
        }
        if self.fields.is_empty() {
            return Err(SyncError::Configuration(format!(
                "mapping for {} has no fields",
                self.object_type
            )));
        }
        let produced = self
            .fields
            .values()
            .any(|e| e.stored_field() == self.natural_key)
            || self.constants.contains_key(&self.natural_key);
        if !produced {
            return Err(SyncError::Configuration(format!(
                "no mapping produces natural key '{}' for {}",
                self.natural_key, self.object_type
            )));
        }
        Ok(())
    }
}
