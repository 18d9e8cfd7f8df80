//! Writer-to-reader record resolution
//!
//! A value is always written with the schema current at push time and read
//! with the newest schema of its store. The resolution plan for a
//! (writer, reader) pair is computed once and cached.

use crate::error::CodecError;
use crate::repository::SchemaRepository;
use crate::schema::{FieldType, RecordSchema, SchemaEntry};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use tidepool_common::{Error, Result};
use tracing::debug;

#[derive(Debug)]
enum FieldStep {
    /// Take the writer's field, checked against the writer type
    Read {
        name: String,
        writer_kind: FieldType,
        to_double: bool,
    },
    /// The writer has no such field
    Fill { name: String, value: Value },
}

/// Resolution plan from one writer schema to one reader schema
#[derive(Debug)]
pub struct RecordDeserializer {
    writer_id: i32,
    reader_id: i32,
    steps: Vec<FieldStep>,
}

impl RecordDeserializer {
    /// Build the plan, failing if the reader cannot be satisfied
    pub fn build(writer: &SchemaEntry, reader: &SchemaEntry) -> Result<Self> {
        let mut steps = Vec::with_capacity(reader.schema.fields.len());
        for field in &reader.schema.fields {
            match writer.schema.field(&field.name) {
                Some(written) => {
                    if !written.kind.readable_as(&field.kind) {
                        return Err(Error::schema(format!(
                            "field {} written as {:?} cannot be read as {:?} (writer {}, reader {})",
                            field.name, written.kind, field.kind, writer.id, reader.id
                        )));
                    }
                    steps.push(FieldStep::Read {
                        name: field.name.clone(),
                        writer_kind: written.kind.clone(),
                        to_double: written.kind == FieldType::Long
                            && matches!(field.kind, FieldType::Double),
                    });
                }
                None => {
                    let value = field.default.clone().ok_or_else(|| {
                        Error::schema(format!(
                            "reader field {} has no default and writer {} lacks it",
                            field.name, writer.id
                        ))
                    })?;
                    steps.push(FieldStep::Fill {
                        name: field.name.clone(),
                        value,
                    });
                }
            }
        }
        Ok(Self {
            writer_id: writer.id,
            reader_id: reader.id,
            steps,
        })
    }

    pub fn writer_id(&self) -> i32 {
        self.writer_id
    }

    pub fn reader_id(&self) -> i32 {
        self.reader_id
    }

    /// Decode a value written with the writer schema into the reader's shape
    ///
    /// Values that do not parse or do not match the writer schema are
    /// corrupt data.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        let value: Value = serde_json::from_slice(bytes).map_err(CodecError::from)?;
        let Value::Object(mut written) = value else {
            return Err(Error::corrupt("stored value is not a record"));
        };

        let mut record = Map::new();
        for step in &self.steps {
            match step {
                FieldStep::Read {
                    name,
                    writer_kind,
                    to_double,
                } => {
                    let value = written.remove(name).ok_or_else(|| {
                        Error::corrupt(format!("stored value lacks field {name}"))
                    })?;
                    if !writer_kind.accepts(&value) {
                        return Err(Error::corrupt(format!(
                            "field {name} does not match writer schema {}",
                            self.writer_id
                        )));
                    }
                    let value = match (*to_double, value.as_i64()) {
                        (true, Some(n)) => Value::from(n as f64),
                        _ => value,
                    };
                    record.insert(name.clone(), value);
                }
                FieldStep::Fill { name, value } => {
                    record.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(Value::Object(record))
    }
}

/// Encode a record value, checking it against the writer schema
pub fn encode_value(schema: &RecordSchema, value: &Value) -> Result<Vec<u8>> {
    let Value::Object(fields) = value else {
        return Err(Error::invalid_argument("value must be a JSON object"));
    };
    for field in &schema.fields {
        match fields.get(&field.name) {
            Some(v) if field.kind.accepts(v) => {}
            Some(_) => {
                return Err(Error::invalid_argument(format!(
                    "field {} does not match schema {}",
                    field.name, schema.name
                )));
            }
            None => {
                return Err(Error::invalid_argument(format!(
                    "field {} of schema {} is missing",
                    field.name, schema.name
                )));
            }
        }
    }
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

type CacheKey = (String, i32, i32);

/// Bounded cache of deserializers keyed by store, writer and reader id
pub struct DeserializerCache {
    capacity: usize,
    entries: DashMap<CacheKey, Arc<RecordDeserializer>>,
}

impl DeserializerCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: DashMap::new(),
        }
    }

    /// Cached deserializer for the pair, built on first use
    pub fn get_or_build(
        &self,
        store: &str,
        writer: &SchemaEntry,
        reader: &SchemaEntry,
    ) -> Result<Arc<RecordDeserializer>> {
        let key = (store.to_string(), writer.id, reader.id);
        if let Some(cached) = self.entries.get(&key) {
            return Ok(Arc::clone(cached.value()));
        }

        let built = Arc::new(RecordDeserializer::build(writer, reader)?);
        if self.entries.len() >= self.capacity {
            let victim = self.entries.iter().next().map(|e| e.key().clone());
            if let Some(victim) = victim {
                self.entries.remove(&victim);
            }
        }
        debug!(
            "Built deserializer for store {} writer {} reader {}",
            store, writer.id, reader.id
        );
        Ok(Arc::clone(self.entries.entry(key).or_insert(built).value()))
    }

    /// Number of cached deserializers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Deserializes stored values of any store using its schema repository
pub struct ValueDecoder {
    repository: Arc<dyn SchemaRepository>,
    cache: DeserializerCache,
}

impl ValueDecoder {
    pub fn new(repository: Arc<dyn SchemaRepository>, cache_capacity: usize) -> Self {
        Self {
            repository,
            cache: DeserializerCache::new(cache_capacity),
        }
    }

    /// Decode `bytes` written with schema `writer_id` of `store`
    ///
    /// The reader schema is the store's newest schema. A missing writer or
    /// reader schema is a schema resolution error.
    pub fn decode(&self, store: &str, writer_id: i32, bytes: &[u8]) -> Result<Value> {
        let reader = self
            .repository
            .latest_value_schema(store)
            .ok_or_else(|| Error::schema(format!("store {store} has no value schema")))?;
        let writer = self
            .repository
            .value_schema(store, writer_id)
            .ok_or_else(|| {
                Error::schema(format!("store {store} has no value schema {writer_id}"))
            })?;
        self.cache
            .get_or_build(store, &writer, &reader)?
            .deserialize(bytes)
    }

    /// Deserializer cache in use
    pub fn cache(&self) -> &DeserializerCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemorySchemaRepository;
    use crate::schema::FieldSchema;
    use serde_json::json;

    fn v1() -> RecordSchema {
        RecordSchema::new(
            "Profile",
            vec![
                FieldSchema::new("id", FieldType::Long),
                FieldSchema::new("name", FieldType::String),
                FieldSchema::new("legacy", FieldType::Boolean),
            ],
        )
    }

    fn v2() -> RecordSchema {
        RecordSchema::new(
            "Profile",
            vec![
                FieldSchema::new("id", FieldType::Double),
                FieldSchema::new("name", FieldType::String),
                FieldSchema::new(
                    "email",
                    FieldType::Optional {
                        inner: Box::new(FieldType::String),
                    },
                )
                .with_default(Value::Null),
            ],
        )
    }

    #[test]
    fn test_resolution_projects_promotes_and_fills() {
        let writer = SchemaEntry::new(1, v1());
        let reader = SchemaEntry::new(2, v2());
        let deserializer = RecordDeserializer::build(&writer, &reader).unwrap();

        let bytes = encode_value(&v1(), &json!({"id": 7, "name": "ann", "legacy": true})).unwrap();
        let value = deserializer.deserialize(&bytes).unwrap();
        assert_eq!(value, json!({"id": 7.0, "name": "ann", "email": null}));
    }

    #[test]
    fn test_reader_field_without_default_fails() {
        let writer = SchemaEntry::new(2, v2());
        let reader = SchemaEntry::new(1, v1());
        assert!(matches!(
            RecordDeserializer::build(&writer, &reader),
            Err(Error::SchemaResolution(_))
        ));
    }

    #[test]
    fn test_bad_payloads_are_corrupt() {
        let entry = SchemaEntry::new(1, v1());
        let deserializer = RecordDeserializer::build(&entry, &entry).unwrap();
        let payloads: [&[u8]; 4] = [
            b"not json",
            br#"[1, 2]"#,
            br#"{"id": 1, "name": "x"}"#,
            br#"{"id": "one", "name": "x", "legacy": false}"#,
        ];
        for bytes in payloads {
            assert!(
                matches!(deserializer.deserialize(bytes), Err(Error::CorruptData(_))),
                "{}",
                String::from_utf8_lossy(bytes)
            );
        }
    }

    #[test]
    fn test_encode_checks_schema() {
        assert!(encode_value(&v1(), &json!({"id": 1, "name": "x"})).is_err());
        assert!(encode_value(&v1(), &json!([1])).is_err());
        assert!(encode_value(&v1(), &json!({"id": 1, "name": 2, "legacy": true})).is_err());
    }

    #[test]
    fn test_decoder_caches_per_pair() {
        let repository = Arc::new(InMemorySchemaRepository::new());
        repository.register("users", 1, v1()).unwrap();
        repository.register("users", 2, v2()).unwrap();
        let decoder = ValueDecoder::new(repository, 8);

        let bytes = encode_value(&v1(), &json!({"id": 1, "name": "a", "legacy": false})).unwrap();
        for _ in 0..3 {
            assert_eq!(decoder.decode("users", 1, &bytes).unwrap()["name"], "a");
        }
        assert_eq!(decoder.cache().len(), 1);

        assert!(matches!(
            decoder.decode("users", 9, &bytes),
            Err(Error::SchemaResolution(_))
        ));
        assert!(matches!(
            decoder.decode("orders", 1, &bytes),
            Err(Error::SchemaResolution(_))
        ));
    }

    #[test]
    fn test_cache_is_bounded() {
        let cache = DeserializerCache::new(2);
        let entry = SchemaEntry::new(1, v1());
        for store in ["a", "b", "c", "d"] {
            cache.get_or_build(store, &entry, &entry).unwrap();
        }
        assert_eq!(cache.len(), 2);
    }
}
