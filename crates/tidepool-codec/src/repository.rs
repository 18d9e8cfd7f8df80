//! Value schema registry

use crate::schema::{RecordSchema, SchemaEntry};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tidepool_common::{Error, Result};
use tracing::debug;

/// Source of the value schemas of each store
pub trait SchemaRepository: Send + Sync {
    /// Schema registered under `id` for `store`
    fn value_schema(&self, store: &str, id: i32) -> Option<Arc<SchemaEntry>>;

    /// Newest schema of `store`, used as the reader schema
    fn latest_value_schema(&self, store: &str) -> Option<Arc<SchemaEntry>>;
}

/// Schema registry held in memory
#[derive(Default)]
pub struct InMemorySchemaRepository {
    schemas: RwLock<HashMap<String, BTreeMap<i32, Arc<SchemaEntry>>>>,
}

impl InMemorySchemaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `schema` as value schema `id` of `store`
    ///
    /// Ids must be positive. Registering the same schema twice is a no-op,
    /// reusing an id for a different schema is rejected.
    pub fn register(&self, store: &str, id: i32, schema: RecordSchema) -> Result<()> {
        if id <= 0 {
            return Err(Error::invalid_argument(format!(
                "value schema id must be positive, got {id}"
            )));
        }
        schema.validate()?;

        let mut schemas = self.schemas.write();
        let versions = schemas.entry(store.to_string()).or_default();
        match versions.get(&id) {
            Some(existing) if existing.schema == schema => Ok(()),
            Some(_) => Err(Error::invalid_argument(format!(
                "store {store} already has a different value schema {id}"
            ))),
            None => {
                debug!("Registered value schema {} for store {}", id, store);
                versions.insert(id, Arc::new(SchemaEntry::new(id, schema)));
                Ok(())
            }
        }
    }

    /// Stores with at least one schema
    pub fn stores(&self) -> Vec<String> {
        let mut stores: Vec<_> = self.schemas.read().keys().cloned().collect();
        stores.sort();
        stores
    }
}

impl SchemaRepository for InMemorySchemaRepository {
    fn value_schema(&self, store: &str, id: i32) -> Option<Arc<SchemaEntry>> {
        self.schemas.read().get(store)?.get(&id).cloned()
    }

    fn latest_value_schema(&self, store: &str) -> Option<Arc<SchemaEntry>> {
        self.schemas
            .read()
            .get(store)?
            .last_key_value()
            .map(|(_, entry)| Arc::clone(entry))
    }
}
