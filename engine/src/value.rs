//! Materialized value representation.
//!
//! Every persisted field is a pair of a logical value and the metadata the
//! merge needs: the ISO-8601 timestamp of the last accepted write. The wire
//! and storage shape is `{"value": ..., "_meta": {"timestamp": ...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Per-field merge metadata.
///
/// Timestamps are ISO-8601 millisecond UTC strings and are compared
/// lexicographically, which for this format equals chronological order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Meta {
    /// Timestamp of the last accepted write, `None` before the first write.
    pub timestamp: Option<String>,
}

impl Meta {
    /// Metadata stamped at a given time.
    pub fn at(timestamp: impl Into<String>) -> Self {
        Self {
            timestamp: Some(timestamp.into()),
        }
    }

    /// Whether this metadata is at least as recent as `other`.
    ///
    /// `None` loses to any stamp; equal stamps count as "at least as recent"
    /// so replaying the same mutation is a no-op.
    pub fn at_least(&self, other: &Meta) -> bool {
        match (&self.timestamp, &other.timestamp) {
            (Some(a), Some(b)) => a.as_str() >= b.as_str(),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// A single materialized field: logical value plus merge metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedField {
    /// The logical value as JSON.
    pub value: Value,
    /// Merge metadata.
    #[serde(rename = "_meta")]
    pub meta: Meta,
}

impl EncodedField {
    /// Build a field stamped at `timestamp`.
    pub fn new(value: Value, timestamp: impl Into<String>) -> Self {
        Self {
            value,
            meta: Meta::at(timestamp),
        }
    }
}

/// A materialized row: one [`EncodedField`] per field name.
///
/// `BTreeMap` keeps iteration deterministic, which keeps merges, generated
/// SQL, and test output stable.
pub type EncodedRow = BTreeMap<String, EncodedField>;

/// Project an encoded row to its user-visible shape: `{field: value}`.
pub fn infer_row(row: &EncodedRow) -> Value {
    let map: serde_json::Map<String, Value> = row
        .iter()
        .map(|(name, field)| (name.clone(), field.value.clone()))
        .collect();
    Value::Object(map)
}

/// Format a UTC instant as the canonical Lattice timestamp.
///
/// RFC 3339 with millisecond precision and a literal `Z` suffix; fixed width
/// so lexicographic comparison matches chronological order.
pub fn format_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialization_shape() {
        let field = EncodedField::new(json!("Ada"), "2026-01-01T00:00:00.000Z");
        let encoded = serde_json::to_value(&field).unwrap();
        assert_eq!(
            encoded,
            json!({"value": "Ada", "_meta": {"timestamp": "2026-01-01T00:00:00.000Z"}})
        );

        let parsed: EncodedField = serde_json::from_value(encoded).unwrap();
        assert_eq!(parsed, field);
    }

    #[test]
    fn meta_comparison_is_lexicographic() {
        let earlier = Meta::at("2026-01-01T00:00:00.000Z");
        let later = Meta::at("2026-01-01T00:00:01.000Z");

        assert!(later.at_least(&earlier));
        assert!(!earlier.at_least(&later));
        // Equal stamps count as already applied.
        assert!(earlier.at_least(&earlier.clone()));
    }

    #[test]
    fn meta_none_loses() {
        let unset = Meta::default();
        let set = Meta::at("2026-01-01T00:00:00.000Z");

        assert!(!unset.at_least(&set));
        assert!(set.at_least(&unset));
        assert!(!unset.at_least(&unset.clone()));
    }

    #[test]
    fn infer_row_projects_values() {
        let mut row = EncodedRow::new();
        row.insert(
            "id".into(),
            EncodedField::new(json!("u1"), "2026-01-01T00:00:00.000Z"),
        );
        row.insert(
            "name".into(),
            EncodedField::new(json!("Ada"), "2026-01-01T00:00:00.000Z"),
        );

        assert_eq!(infer_row(&row), json!({"id": "u1", "name": "Ada"}));
    }

    #[test]
    fn timestamp_format_is_fixed_width() {
        let at = chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00.007Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(format_timestamp(at), "2026-01-01T00:00:00.007Z");
    }
}
