//! Record schemas
//!
//! Values are JSON objects described by a record schema: an ordered list of
//! typed fields, each optionally carrying a default used when a reader
//! expects a field the writer did not produce.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidepool_common::{Error, Result};

/// Type of a record field
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    Boolean,
    Long,
    Double,
    String,
    /// Homogeneous list
    Array { items: Box<FieldType> },
    /// Value or null
    Optional { inner: Box<FieldType> },
    /// Any JSON value
    Any,
}

impl FieldType {
    /// Check that `value` conforms to this type
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Any, _)
            | (Self::Boolean, Value::Bool(_))
            | (Self::String, Value::String(_))
            | (Self::Optional { .. }, Value::Null) => true,
            (Self::Long, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Double, Value::Number(_)) => true,
            (Self::Array { items }, Value::Array(values)) => values.iter().all(|v| items.accepts(v)),
            (Self::Optional { inner }, v) => inner.accepts(v),
            _ => false,
        }
    }

    /// Check that values written as `self` can be read as `reader`
    pub fn readable_as(&self, reader: &Self) -> bool {
        match (self, reader) {
            (_, Self::Any) | (Self::Long, Self::Double) => true,
            (Self::Array { items: w }, Self::Array { items: r }) => w.readable_as(r),
            (Self::Optional { inner: w }, Self::Optional { inner: r }) => w.readable_as(r),
            (w, Self::Optional { inner: r }) => w.readable_as(r),
            (w, r) => w == r,
        }
    }
}

/// One field of a record schema
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldType,
    /// Value used when the writer did not produce this field
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub default: Option<Value>,
}

/// Keep an explicit `null` default instead of treating it as absent
fn present_value<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, kind: FieldType) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Schema of a record value
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    /// Record name
    pub name: String,
    /// Fields in declaration order
    pub fields: Vec<FieldSchema>,
}

impl RecordSchema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldSchema>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Parse and validate a schema from JSON
    pub fn parse(json: &str) -> Result<Self> {
        let schema: Self = serde_json::from_str(json)
            .map_err(|e| Error::schema(format!("unparsable record schema: {e}")))?;
        schema.validate()?;
        Ok(schema)
    }

    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Reject duplicate fields and defaults that do not match their type
    pub fn validate(&self) -> Result<()> {
        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::schema(format!(
                    "record {} declares field {} twice",
                    self.name, field.name
                )));
            }
            if let Some(default) = &field.default
                && !field.kind.accepts(default)
            {
                return Err(Error::schema(format!(
                    "default of {}.{} does not match its type",
                    self.name, field.name
                )));
            }
        }
        Ok(())
    }
}

/// A registered schema and its id
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaEntry {
    pub id: i32,
    pub schema: RecordSchema,
}

impl SchemaEntry {
    pub fn new(id: i32, schema: RecordSchema) -> Self {
        Self { id, schema }
    }
}
