//! Field type algebra.
//!
//! A field descriptor knows how to encode a user-visible value into its
//! transport/storage shape, how to merge an incoming encoded mutation against
//! the current materialized value, and how it projects to a relational
//! column. Field types are immutable; every modifier returns a new instance.

use crate::error::{Error, Result};
use crate::value::EncodedField;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of mutation being encoded or merged.
///
/// `Set` is the only kind today; `Delete` is reserved by the protocol and is
/// rejected at encode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Set,
}

/// Atomic field kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Timestamp,
    Json,
    Enum { name: String, values: Vec<String> },
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::String => write!(f, "string"),
            FieldKind::Number => write!(f, "number"),
            FieldKind::Boolean => write!(f, "boolean"),
            FieldKind::Timestamp => write!(f, "timestamp"),
            FieldKind::Json => write!(f, "json"),
            FieldKind::Enum { .. } => write!(f, "enum"),
        }
    }
}

/// A foreign-key reference to `collection.field`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldReference {
    pub collection: String,
    pub field: String,
}

/// A typed field of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldType {
    pub kind: FieldKind,
    pub nullable: bool,
    pub unique: bool,
    pub index: bool,
    pub primary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<FieldReference>,
}

/// A string field.
pub fn string() -> FieldType {
    FieldType::of(FieldKind::String)
}

/// A double-precision number field.
pub fn number() -> FieldType {
    FieldType::of(FieldKind::Number)
}

/// A boolean field.
pub fn boolean() -> FieldType {
    FieldType::of(FieldKind::Boolean)
}

/// A timestamp field, stored as ISO-8601 UTC.
pub fn timestamp() -> FieldType {
    FieldType::of(FieldKind::Timestamp)
}

/// An arbitrary JSON field.
pub fn json() -> FieldType {
    FieldType::of(FieldKind::Json)
}

/// A named enum field constrained to `values`.
pub fn enumeration<I, S>(name: impl Into<String>, values: I) -> FieldType
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    FieldType::of(FieldKind::Enum {
        name: name.into(),
        values: values.into_iter().map(Into::into).collect(),
    })
}

/// The primary-key field: a unique, indexed string.
pub fn id() -> FieldType {
    string().primary().unique().index()
}

/// A foreign-key field referencing `collection.field`.
pub fn reference(collection: impl Into<String>, field: impl Into<String>) -> FieldType {
    let mut ft = string();
    ft.references = Some(FieldReference {
        collection: collection.into(),
        field: field.into(),
    });
    ft
}

impl FieldType {
    fn of(kind: FieldKind) -> Self {
        Self {
            kind,
            nullable: false,
            unique: false,
            index: false,
            primary: false,
            default: None,
            references: None,
        }
    }

    /// Allow `null` values; marks the storage column nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Add a unique constraint.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Add a storage index.
    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    /// Mark as the primary field of its collection.
    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    /// Attach a default value, projected into the storage column.
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Wrap a user-visible value into its transport/storage payload.
    ///
    /// Runs the convert-hook, validates the result against the field kind,
    /// and stamps it at `ts`.
    pub fn encode_mutation(
        &self,
        kind: MutationKind,
        field: &str,
        input: Value,
        ts: &str,
    ) -> Result<EncodedField> {
        match kind {
            MutationKind::Set => {}
        }

        if input.is_null() {
            if !self.nullable {
                return Err(Error::InvalidValue {
                    field: field.to_string(),
                    expected: self.kind.to_string(),
                    got: "null".to_string(),
                });
            }
            return Ok(EncodedField::new(Value::Null, ts));
        }

        let converted = self.convert(input);
        self.check(field, &converted)?;
        Ok(EncodedField::new(converted, ts))
    }

    /// Merge an incoming encoded mutation against the current value.
    ///
    /// Pure last-writer-wins: if the current timestamp is at least the
    /// incoming one the current value survives and the accepted diff is
    /// `None`; otherwise the incoming value (normalized by the convert-hook)
    /// replaces it and is returned as the accepted diff. Merge never fails.
    pub fn merge_mutation(
        &self,
        _kind: MutationKind,
        encoded: EncodedField,
        current: Option<&EncodedField>,
    ) -> (EncodedField, Option<EncodedField>) {
        if let Some(current) = current {
            if current.meta.at_least(&encoded.meta) {
                return (current.clone(), None);
            }
        }

        let accepted = EncodedField {
            value: if encoded.value.is_null() {
                Value::Null
            } else {
                self.convert(encoded.value)
            },
            meta: encoded.meta,
        };
        (accepted.clone(), Some(accepted))
    }

    /// How this field projects to a relational column.
    pub fn storage_field_type(&self) -> StorageFieldType {
        let (sql_type, enum_values, enum_name) = match &self.kind {
            FieldKind::String if self.references.is_some() => (SqlType::Varchar, None, None),
            FieldKind::String => (SqlType::Text, None, None),
            FieldKind::Number => (SqlType::DoublePrecision, None, None),
            FieldKind::Boolean => (SqlType::Boolean, None, None),
            FieldKind::Timestamp => (SqlType::TimestampTz, None, None),
            FieldKind::Json => (SqlType::Jsonb, None, None),
            FieldKind::Enum { name, values } => (
                SqlType::Text,
                Some(values.clone()),
                Some(format!("{name}_enum")),
            ),
        };

        StorageFieldType {
            sql_type,
            nullable: self.nullable,
            unique: self.unique,
            index: self.index || self.primary,
            primary: self.primary,
            default: self.default.clone(),
            references: self.references.clone(),
            enum_values,
            enum_name,
        }
    }

    /// Convert-hook: normalize a raw incoming value. Total by design so that
    /// merge can never fail; values it cannot normalize pass through and are
    /// caught by `check` on the encode path.
    fn convert(&self, value: Value) -> Value {
        let normalized = match &self.kind {
            FieldKind::Number => value
                .as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            FieldKind::Boolean => match value.as_str() {
                Some("true") => Some(Value::Bool(true)),
                Some("false") => Some(Value::Bool(false)),
                _ => None,
            },
            FieldKind::Timestamp => match &value {
                Value::String(s) => chrono::DateTime::parse_from_rfc3339(s).ok().map(|dt| {
                    Value::String(crate::value::format_timestamp(dt.with_timezone(&chrono::Utc)))
                }),
                Value::Number(n) => n
                    .as_i64()
                    .and_then(chrono::DateTime::from_timestamp_millis)
                    .map(|dt| Value::String(crate::value::format_timestamp(dt))),
                _ => None,
            },
            FieldKind::Json => value.as_str().and_then(|s| serde_json::from_str(s).ok()),
            _ => None,
        };
        normalized.unwrap_or(value)
    }

    /// Validate a converted value against the field kind.
    fn check(&self, field: &str, value: &Value) -> Result<()> {
        let ok = match &self.kind {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Timestamp => value
                .as_str()
                .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
                .unwrap_or(false),
            FieldKind::Json => true,
            FieldKind::Enum { values, .. } => match value.as_str() {
                Some(s) if values.iter().any(|v| v == s) => true,
                Some(s) => {
                    return Err(Error::UnknownEnumValue {
                        field: field.to_string(),
                        value: s.to_string(),
                    })
                }
                None => false,
            },
        };

        if ok {
            Ok(())
        } else {
            Err(Error::InvalidValue {
                field: field.to_string(),
                expected: self.kind.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }

    /// Whether ordered comparators (`$gt` and friends) apply to this field.
    pub fn is_ordered(&self) -> bool {
        matches!(self.kind, FieldKind::Number | FieldKind::Timestamp)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// SQL column types used by the reference back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SqlType {
    Text,
    Varchar,
    DoublePrecision,
    Boolean,
    TimestampTz,
    Jsonb,
}

impl SqlType {
    /// The DDL spelling of this type.
    pub fn ddl(&self) -> &'static str {
        match self {
            SqlType::Text => "text",
            SqlType::Varchar => "varchar",
            SqlType::DoublePrecision => "double precision",
            SqlType::Boolean => "boolean",
            SqlType::TimestampTz => "timestamptz",
            SqlType::Jsonb => "jsonb",
        }
    }

    /// Whether an `information_schema.columns.data_type` value matches.
    pub fn matches_data_type(&self, data_type: &str) -> bool {
        match self {
            SqlType::Text => data_type == "text",
            SqlType::Varchar => data_type == "character varying",
            SqlType::DoublePrecision => data_type == "double precision",
            SqlType::Boolean => data_type == "boolean",
            SqlType::TimestampTz => data_type == "timestamp with time zone",
            SqlType::Jsonb => data_type == "jsonb",
        }
    }
}

/// Relational projection of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageFieldType {
    pub sql_type: SqlType,
    pub nullable: bool,
    pub unique: bool,
    pub index: bool,
    pub primary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<FieldReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    /// Generated constraint name for enum fields, `<name>_enum`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_name: Option<String>,
}
