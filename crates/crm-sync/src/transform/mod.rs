//! Mapping-table driven record transformation.
//!
//! [`transform`] is a pure function of a [`SourceRecord`] and a
//! [`MappingTable`]: no I/O, no clock, no shared state. The same inputs always
//! produce the same [`TransformedRecord`], field order included.

mod mapping;

pub use mapping::{Coercion, MappingEntry, MappingTable, ValueKind};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Number, Value};

use crate::core::{SourceRecord, TransformedRecord};
use crate::error::{Result, SyncError};

/// Separator used by [`ValueKind::ArrayJoin`].
pub const ARRAY_SEPARATOR: &str = ";";

/// Transform one source record according to `table`.
///
/// Missing and `null` source fields are skipped. A value that cannot be
/// coerced fails the whole record with [`SyncError::Validation`].
pub fn transform(record: &SourceRecord, table: &MappingTable) -> Result<TransformedRecord> {
    let mut out = TransformedRecord::new(table.object_type.clone());

    for (field, value) in &table.constants {
        out.fields.insert(field.clone(), value.clone());
    }

    for (source_field, entry) in &table.fields {
        let raw = match record.get(source_field) {
            None | Some(Value::Null) => continue,
            Some(v) => v,
        };
        let value = match convert(raw, &entry.kind).map_err(|reason| {
            SyncError::Validation(format!(
                "record {}: field '{}' {}",
                record.display_id(),
                source_field,
                reason
            ))
        })? {
            Some(v) => v,
            None => continue,
        };
        let target = entry.stored_field();
        let value = if table.display_name_field.as_deref() == Some(target.as_str()) {
            display_name(&value, table.display_name_prefix.as_deref())
        } else {
            value
        };
        out.fields.insert(target, value);
    }

    Ok(out)
}

/// Escape parentheses in a display name and apply the optional prefix.
///
/// `"Q1 (Draft)"` becomes `"Q1 [Draft]"`.
pub fn escape_display_name(name: &str) -> String {
    name.replace('(', "[").replace(')', "]")
}

fn display_name(value: &Value, prefix: Option<&str>) -> Value {
    let escaped = escape_display_name(&render(value));
    match prefix {
        Some(prefix) => Value::String(format!("{}{}", prefix, escaped)),
        None => Value::String(escaped),
    }
}

/// Convert one non-null source value. `Ok(None)` means "skip this field".
fn convert(value: &Value, kind: &ValueKind) -> std::result::Result<Option<Value>, String> {
    match kind {
        ValueKind::Scalar => Ok(Some(scalar(value))),
        ValueKind::ArrayJoin => {
            let joined = match value {
                Value::Array(items) => items
                    .iter()
                    .map(render)
                    .collect::<Vec<_>>()
                    .join(ARRAY_SEPARATOR),
                other => render(other),
            };
            Ok(Some(Value::String(joined)))
        }
        ValueKind::NestedObjectName { property } => match value {
            Value::Object(map) => {
                let picked = [property.as_str(), "id", "_value"]
                    .iter()
                    .filter_map(|key| map.get(*key))
                    .find(|v| is_present(v));
                Ok(Some(match picked {
                    Some(v) => scalar(v),
                    None => Value::String(value.to_string()),
                }))
            }
            other => Ok(Some(scalar(other))),
        },
        ValueKind::NestedJsonPath { path, .. } => {
            Ok(walk(value, path).filter(|v| !v.is_null()).map(scalar))
        }
        ValueKind::TypeCoerced { to } => coerce(value, *to).map(Some),
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Primitives unchanged, structured values as compact JSON strings.
fn scalar(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
        other => other.clone(),
    }
}

/// String form of a value: strings unquoted, null empty, the rest as JSON.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn walk<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn coerce(value: &Value, to: Coercion) -> std::result::Result<Value, String> {
    let fail = || format!("cannot coerce {} to {:?}", value, to);
    match to {
        Coercion::String => Ok(Value::String(render(value))),
        Coercion::Integer => as_integer(value).map(Value::from).ok_or_else(fail),
        Coercion::Number => as_number(value)
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(fail),
        Coercion::Boolean => as_bool(value).map(Value::Bool).ok_or_else(fail),
        Coercion::EpochMillis => match value {
            Value::Number(_) => as_integer(value).map(Value::from).ok_or_else(fail),
            Value::String(s) => match s.trim().parse::<i64>() {
                Ok(ms) => Ok(Value::from(ms)),
                Err(_) => parse_datetime(s)
                    .map(|dt| Value::from(dt.timestamp_millis()))
                    .ok_or_else(fail),
            },
            _ => Err(fail()),
        },
        Coercion::Date => as_datetime(value)
            .map(|dt| Value::String(dt.format("%Y-%m-%d").to_string()))
            .ok_or_else(fail),
        Coercion::DateTime => as_datetime(value)
            .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)))
            .ok_or_else(fail),
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(_) => as_integer(value).and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => parse_datetime(s),
        _ => None,
    }
}

/// Parse the timestamp shapes CRM APIs emit.
///
/// Accepts RFC 3339, `2019-05-09T14:37:51Z+0000`, naive date-times (as UTC)
/// and plain dates (midnight UTC).
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%SZ%z", "%Y-%m-%dT%H:%M:%S%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CAMPAIGN_MAPPING: &str = r#"
object_type: campaigns
natural_key: hs_name
display_name_field: hs_name
constants:
  processingType: MANUAL
  hs_name: placeholder
fields:
  name: { target: hs_name }
  tags: { target: hs_tags, kind: array_join }
  folder: { target: folder, kind: nested_object_name }
  channel: { target: channel, kind: nested_json_path, path: Label.LocalizedLabels.0.Label }
  createdAt: { target: hs_created, kind: type_coerced, to: epoch_millis }
  budget: { target: budget, kind: type_coerced, to: number }
"#;

    fn table() -> MappingTable {
        MappingTable::from_yaml(CAMPAIGN_MAPPING).unwrap()
    }

    fn record(value: Value) -> SourceRecord {
        SourceRecord::from_json(value, "id")
    }

    #[test]
    fn test_transform_is_pure() {
        let table = table();
        let source = record(json!({
            "id": 1,
            "name": "Spring Launch",
            "tags": ["a", "b"],
            "folder": {"id": 7, "type": "Folder"},
            "createdAt": "2019-05-09T14:37:51Z+0000"
        }));
        let a = transform(&source, &table).unwrap();
        let b = transform(&source, &table).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_display_name_parentheses_become_brackets() {
        let out = transform(&record(json!({"id": 1, "name": "Q1 (Draft)"})), &table()).unwrap();
        assert_eq!(out.get("hs_name"), Some(&json!("Q1 [Draft]")));
    }

    #[test]
    fn test_display_name_prefix_applied_after_escaping() {
        let mut table = table();
        table.display_name_prefix = Some("(Campaign) ".into());
        let out = transform(&record(json!({"id": 1, "name": "Spring (EU)"})), &table).unwrap();
        assert_eq!(out.get("hs_name"), Some(&json!("(Campaign) Spring [EU]")));
    }

    #[test]
    fn test_mapped_fields_override_constants() {
        let out = transform(&record(json!({"id": 1, "name": "Real"})), &table()).unwrap();
        assert_eq!(out.get("hs_name"), Some(&json!("Real")));
        assert_eq!(out.get("processingType"), Some(&json!("MANUAL")));
    }

    #[test]
    fn test_missing_and_null_fields_are_skipped() {
        let out = transform(
            &record(json!({"id": 1, "name": "Q1", "tags": null})),
            &table(),
        )
        .unwrap();
        assert!(out.get("hs_tags").is_none());
        assert!(out.get("budget").is_none());
    }

    #[test]
    fn test_array_join() {
        let out = transform(
            &record(json!({"name": "x", "tags": ["web", 2, true]})),
            &table(),
        )
        .unwrap();
        assert_eq!(out.get("hs_tags"), Some(&json!("web;2;true")));
    }

    #[test]
    fn test_nested_object_name_fallbacks() {
        let kind = ValueKind::NestedObjectName {
            property: "name".into(),
        };
        assert_eq!(
            convert(&json!({"name": "Owner", "id": 3}), &kind).unwrap(),
            Some(json!("Owner"))
        );
        assert_eq!(
            convert(&json!({"id": 3}), &kind).unwrap(),
            Some(json!(3))
        );
        assert_eq!(
            convert(&json!({"_value": "guid-1"}), &kind).unwrap(),
            Some(json!("guid-1"))
        );
        assert_eq!(
            convert(&json!({"type": "Folder"}), &kind).unwrap(),
            Some(json!(r#"{"type":"Folder"}"#))
        );
    }

    #[test]
    fn test_nested_json_path_uses_suffix() {
        let out = transform(
            &record(json!({
                "name": "x",
                "channel": {"Label": {"LocalizedLabels": [{"Label": "Webinar"}]}}
            })),
            &table(),
        )
        .unwrap();
        assert_eq!(out.get("channelname"), Some(&json!("Webinar")));
        assert!(out.get("channel").is_none());
    }

    #[test]
    fn test_nested_json_path_missing_is_skipped() {
        let out = transform(
            &record(json!({"name": "x", "channel": {"Label": {}}})),
            &table(),
        )
        .unwrap();
        assert!(out.get("channelname").is_none());
    }

    #[test]
    fn test_epoch_millis_from_crm_timestamp() {
        let out = transform(
            &record(json!({"name": "x", "createdAt": "2019-05-09T14:37:51Z+0000"})),
            &table(),
        )
        .unwrap();
        assert_eq!(out.get("hs_created"), Some(&json!(1557412671000i64)));
    }

    #[test]
    fn test_failed_coercion_fails_record() {
        let err = transform(
            &record(json!({"id": 9, "name": "x", "budget": "lots"})),
            &table(),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(err.to_string().contains("budget"));
    }

    #[test]
    fn test_coercions() {
        assert_eq!(coerce(&json!("42"), Coercion::Integer).unwrap(), json!(42));
        assert_eq!(coerce(&json!(3.0), Coercion::Integer).unwrap(), json!(3));
        assert!(coerce(&json!(3.5), Coercion::Integer).is_err());
        assert_eq!(coerce(&json!("yes"), Coercion::Boolean).unwrap(), json!(true));
        assert_eq!(coerce(&json!(0), Coercion::Boolean).unwrap(), json!(false));
        assert_eq!(
            coerce(&json!("2024-02-29T10:00:00+02:00"), Coercion::Date).unwrap(),
            json!("2024-02-29")
        );
        assert_eq!(
            coerce(&json!(0), Coercion::DateTime).unwrap(),
            json!("1970-01-01T00:00:00.000Z")
        );
        assert_eq!(coerce(&json!(12), Coercion::String).unwrap(), json!("12"));
    }

    #[test]
    fn test_mapping_without_natural_key_is_rejected() {
        let err = MappingTable::from_yaml(
            r#"
object_type: contacts
natural_key: email
fields:
  name: { target: firstname }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[test]
    fn test_json_path_requires_path() {
        let result = MappingTable::from_yaml(
            r#"
object_type: contacts
natural_key: email
fields:
  email: { target: email }
  owner: { target: owner, kind: nested_json_path }
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_json_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contacts.json");
        std::fs::write(
            &path,
            r#"{"object_type":"contacts","natural_key":"email",
                "fields":{"email":{"target":"email"},"createdAt":{"target":"createdate","kind":"type_coerced","to":"date_time"}}}"#,
        )
        .unwrap();
        let table = MappingTable::load(&path).unwrap();
        assert_eq!(
            table.fields["createdAt"].kind,
            ValueKind::TypeCoerced {
                to: Coercion::DateTime
            }
        );
    }
}
