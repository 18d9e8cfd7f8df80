//! Store client: lifecycle, subscriptions and the read path
//!
//! A lookup pins the store's current version for its whole duration, so
//! the partition count used for routing, the storage the value is read
//! from, and the compression used to decode it all belong to the same
//! version even while a newer version is being swapped in.

use crate::ingestion::{IngestionController, IngestionService, LocalIngestion};
use crate::lifecycle::{Service, ServiceSet};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tidepool_codec::{CompressorFactory, SchemaRepository, ValueDecoder};
use tidepool_common::{Config, Error, PartitionId, Result};
use tidepool_meta::{Coordinator, MetadataCache};
use tidepool_storage::StorageService;
use tidepool_storage::chunking::read_value;
use tracing::{debug, info};

struct StorageLifecycle(Arc<StorageService>);

impl Service for StorageLifecycle {
    fn name(&self) -> &str {
        "storage"
    }

    fn start(&self) -> Result<()> {
        // a failed start closes storage again while unwinding
        self.0.reopen();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.0.close()
    }
}

struct MetadataLifecycle {
    cache: Arc<MetadataCache>,
    coordinator: Arc<dyn Coordinator>,
}

impl Service for MetadataLifecycle {
    fn name(&self) -> &str {
        "metadata"
    }

    fn start(&self) -> Result<()> {
        self.cache.refresh()?;
        self.cache.start_dispatcher()
    }

    fn stop(&self) -> Result<()> {
        // watches go before the connection
        self.cache.close();
        self.coordinator.close()
    }
}

struct IngestionLifecycle(Arc<IngestionController>);

impl Service for IngestionLifecycle {
    fn name(&self) -> &str {
        "ingestion"
    }

    fn start(&self) -> Result<()> {
        self.0.start_worker()
    }

    fn stop(&self) -> Result<()> {
        self.0.close();
        Ok(())
    }
}

/// Embedded client serving reads of subscribed store partitions
pub struct StoreClient {
    config: Config,
    cache: Arc<MetadataCache>,
    storage: Arc<StorageService>,
    controller: Arc<IngestionController>,
    decoder: ValueDecoder,
    compressors: CompressorFactory,
    services: ServiceSet,
    started: AtomicBool,
    closed: AtomicBool,
}

impl StoreClient {
    /// Create a client
    ///
    /// The configured watch mode must match the coordinator's.
    pub fn new(
        config: Config,
        coordinator: Arc<dyn Coordinator>,
        schemas: Arc<dyn SchemaRepository>,
        ingestion: Arc<dyn IngestionService>,
    ) -> Result<Self> {
        config.validate()?;
        if config.metadata.watch_mode != coordinator.watch_mode() {
            return Err(Error::Configuration(format!(
                "metadata.watch_mode is {:?} but the coordinator delivers {:?} watches",
                config.metadata.watch_mode,
                coordinator.watch_mode()
            )));
        }

        let cache = Arc::new(MetadataCache::new(
            Arc::clone(&coordinator),
            &config.cluster.name,
        ));
        let storage = Arc::new(StorageService::new(config.storage.clone()));
        let controller =
            IngestionController::new(Arc::clone(&cache), Arc::clone(&storage), ingestion);
        let decoder = ValueDecoder::new(schemas, config.read.deserializer_cache_capacity);

        let mut services = ServiceSet::new();
        services.add(Arc::new(StorageLifecycle(Arc::clone(&storage))));
        services.add(Arc::new(MetadataLifecycle {
            cache: Arc::clone(&cache),
            coordinator,
        }));
        services.add(Arc::new(IngestionLifecycle(Arc::clone(&controller))));

        Ok(Self {
            config,
            cache,
            storage,
            controller,
            decoder,
            compressors: CompressorFactory::new(),
            services,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Create a client serving data written directly to local storage
    pub fn with_local_ingestion(
        config: Config,
        coordinator: Arc<dyn Coordinator>,
        schemas: Arc<dyn SchemaRepository>,
    ) -> Result<Self> {
        Self::new(config, coordinator, schemas, Arc::new(LocalIngestion))
    }

    /// Start all collaborators
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::internal("client is closed"));
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }
        if let Err(e) = self.services.start_all() {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!(
            "Store client started for cluster {} with {} stores",
            self.config.cluster.name,
            self.cache.len()
        );
        Ok(())
    }

    /// Stop all collaborators; closing twice is a no-op
    ///
    /// Every collaborator is stopped even if some fail, and the client is
    /// stopped afterwards either way.
    pub fn close(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed.store(true, Ordering::SeqCst);
        let result = self.services.stop_all();
        info!("Store client closed");
        result
    }

    /// Whether `start` succeeded and `close` has not been called since
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Configuration the client was created with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Local replica of the cluster's store metadata
    pub fn metadata(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    /// Local storage of installed versions
    pub fn storage(&self) -> &Arc<StorageService> {
        &self.storage
    }

    /// Per-store backends and version promotion
    pub fn controller(&self) -> &Arc<IngestionController> {
        &self.controller
    }

    /// Value decoder with its deserializer cache
    pub fn decoder(&self) -> &ValueDecoder {
        &self.decoder
    }

    /// Serve reads of `partitions` of `store`; already subscribed ones are kept
    pub async fn subscribe(&self, store: &str, partitions: &[PartitionId]) -> Result<()> {
        self.check_started()?;
        self.controller.subscribe(store, partitions).await
    }

    /// Serve reads of every partition of the store's current version
    pub async fn subscribe_all(&self, store: &str) -> Result<()> {
        self.check_started()?;
        self.controller.subscribe_all(store).await
    }

    /// Stop serving reads of `partitions` of `store`
    pub async fn unsubscribe(&self, store: &str, partitions: &[PartitionId]) -> Result<()> {
        self.check_started()?;
        self.controller.unsubscribe(store, partitions).await
    }

    /// Look up `key` in `store`
    ///
    /// Returns `Ok(None)` when the key has no value. Errors are never
    /// retried here.
    pub fn get(&self, store: &str, key: &[u8]) -> Result<Option<Value>> {
        self.check_started()?;
        let record = self
            .cache
            .get(store)
            .ok_or_else(|| Error::StoreNotFound(store.to_string()))?;
        if !record.enable_reads {
            return Err(Error::ReadDisabled(store.to_string()));
        }
        let no_version = || Error::NoReadyVersion {
            store: store.to_string(),
        };
        let backend = self.controller.backend(store).ok_or_else(no_version)?;

        let handle = backend.current().borrow().map_err(|e| match e {
            Error::NotReady(_) => no_version(),
            other => other,
        })?;
        let version = handle.version();
        let partition = handle.route(key)?;
        if !backend.subscription().contains(partition) {
            return Err(Error::PartitionNotSubscribed {
                store: store.to_string(),
                version: version.number,
                partition,
            });
        }

        let Some(stored) = read_value(
            handle.engine().as_ref(),
            partition,
            key,
            version.chunking_enabled,
        )?
        else {
            debug!("No value in {} partition {}", version.data_location(), partition);
            return Ok(None);
        };
        let bytes = self
            .compressors
            .decompress(version.compression_strategy, &stored.payload)?;
        self.decoder.decode(store, stored.schema_id, &bytes).map(Some)
    }

    /// Look up `key` and deserialize the record into `V`
    pub fn get_as<V: DeserializeOwned>(&self, store: &str, key: &[u8]) -> Result<Option<V>> {
        self.get(store, key)?
            .map(|value| {
                serde_json::from_value(value)
                    .map_err(|e| Error::corrupt(format!("record of {store} does not fit: {e}")))
            })
            .transpose()
    }

    fn check_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(Error::NotStarted)
        }
    }
}

impl Drop for StoreClient {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("Failed to close store client: {}", e);
        }
    }
}
