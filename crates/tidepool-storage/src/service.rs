//! Storage service owning one engine per data location

use crate::engine::StorageEngine;
use crate::memory::MemoryStorageEngine;
use crate::redb_engine::RedbStorageEngine;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tidepool_common::config::{StorageBackend, StorageConfig};
use tidepool_common::{DataLocation, Error, Result};
use tracing::{debug, error, info};

/// An engine and the number of `open` calls not yet matched by `retire`
struct OpenEngine {
    engine: Arc<dyn StorageEngine>,
    opens: usize,
}

/// Opens, hands out and retires storage engines
///
/// Opens of one location share a single engine, which is closed only when
/// every open has been retired.
pub struct StorageService {
    config: StorageConfig,
    engines: RwLock<HashMap<DataLocation, OpenEngine>>,
    closed: AtomicBool,
}

impl StorageService {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            engines: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Storage configuration in use
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Accept opens again after `close`
    pub fn reopen(&self) {
        if self.closed.swap(false, Ordering::SeqCst) {
            info!("Storage service reopened");
        }
    }

    /// Engine for `location`, opening it on first use
    ///
    /// Every call must be matched by one `retire`.
    pub fn open(&self, location: &DataLocation) -> Result<Arc<dyn StorageEngine>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::storage("storage service is closed"));
        }

        let mut engines = self.engines.write();
        if let Some(open) = engines.get_mut(location) {
            open.opens += 1;
            return Ok(Arc::clone(&open.engine));
        }
        let engine: Arc<dyn StorageEngine> = match self.config.backend {
            StorageBackend::Memory => Arc::new(MemoryStorageEngine::new(location.clone())),
            StorageBackend::Redb => Arc::new(RedbStorageEngine::open(
                &self.config.data_dir,
                location.clone(),
            )?),
        };
        info!("Opened {:?} storage for {}", self.config.backend, location);
        engines.insert(
            location.clone(),
            OpenEngine {
                engine: Arc::clone(&engine),
                opens: 1,
            },
        );
        Ok(engine)
    }

    /// Engine for `location` if it is open
    pub fn get(&self, location: &DataLocation) -> Option<Arc<dyn StorageEngine>> {
        self.engines
            .read()
            .get(location)
            .map(|open| Arc::clone(&open.engine))
    }

    /// Open locations
    pub fn locations(&self) -> Vec<DataLocation> {
        let mut locations: Vec<_> = self.engines.read().keys().cloned().collect();
        locations.sort();
        locations
    }

    /// Release one open of a retired version
    ///
    /// The engine is closed with the last open, and its data is removed
    /// when `delete_retired_data` is set.
    pub fn retire(&self, location: &DataLocation) -> Result<()> {
        let engine = {
            let mut engines = self.engines.write();
            let Some(open) = engines.get_mut(location) else {
                return Ok(());
            };
            open.opens -= 1;
            if open.opens > 0 {
                debug!("Storage for {} still open {} times", location, open.opens);
                return Ok(());
            }
            engines.remove(location).map(|open| open.engine)
        };
        let Some(engine) = engine else {
            return Ok(());
        };
        if self.config.delete_retired_data {
            engine.destroy()?;
        } else {
            engine.close()?;
        }
        info!("Retired storage for {}", location);
        Ok(())
    }

    /// Close every engine, attempting all of them
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let engines: Vec<_> = self.engines.write().drain().collect();
        let mut first: Option<Error> = None;
        for (location, open) in engines {
            if let Err(e) = open.engine.close() {
                error!("Failed to close storage for {}: {}", location, e);
                first.get_or_insert(e.into());
            }
        }
        first.map_or(Ok(()), Err)
    }
}
