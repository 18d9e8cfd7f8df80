//! Store and version backends
//!
//! The controller keeps one [`StoreBackend`] per store the client
//! subscribed to. Each backend holds a [`VersionRef`] to the version
//! serving reads and the set of subscribed partitions. When the metadata
//! cache reports a new current version, the controller makes the
//! subscribed partitions available in the new version's storage and swaps
//! it in; the previous version is torn down once its last reader is done.
//!
//! Metadata listeners run on the cache's dispatcher thread, so they only
//! queue [`BackendCommand`]s; the async worker started by
//! [`IngestionController::start_worker`] applies them.

use crate::subscription::SubscriptionSet;
use crate::version_ref::{Teardown, VersionRef};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tidepool_common::{Error, PartitionId, Result, StoreRecord, VersionNumber, VersionRecord};
use tidepool_meta::{MetadataCache, StoreChangeListener};
use tidepool_partition::{PartitionRouter, PartitionerFactory};
use tidepool_storage::{StorageEngine, StorageService};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pipeline filling local storage with a version's partitions
#[async_trait]
pub trait IngestionService: Send + Sync {
    /// Make `partition` of `version` available in `engine`
    async fn start_consumption(
        &self,
        version: &VersionRecord,
        engine: Arc<dyn StorageEngine>,
        partition: PartitionId,
    ) -> Result<()>;

    /// Stop serving `partition` of `version` and drop its local data
    async fn stop_consumption(
        &self,
        version: &VersionRecord,
        engine: Arc<dyn StorageEngine>,
        partition: PartitionId,
    ) -> Result<()>;
}

/// Ingestion for data written straight into local storage
///
/// Consuming a partition only creates it; whoever produced the data has
/// already written it to the engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalIngestion;

#[async_trait]
impl IngestionService for LocalIngestion {
    async fn start_consumption(
        &self,
        version: &VersionRecord,
        engine: Arc<dyn StorageEngine>,
        partition: PartitionId,
    ) -> Result<()> {
        engine.add_partition(partition)?;
        debug!(
            "Partition {} of {} ready",
            partition,
            version.data_location()
        );
        Ok(())
    }

    async fn stop_consumption(
        &self,
        version: &VersionRecord,
        engine: Arc<dyn StorageEngine>,
        partition: PartitionId,
    ) -> Result<()> {
        engine.drop_partition(partition)?;
        debug!(
            "Partition {} of {} dropped",
            partition,
            version.data_location()
        );
        Ok(())
    }
}

/// Everything the read path needs from one ingested version
pub struct VersionBackend {
    version: VersionRecord,
    engine: Arc<dyn StorageEngine>,
    router: Arc<dyn PartitionRouter>,
}

impl VersionBackend {
    pub fn version(&self) -> &VersionRecord {
        &self.version
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Partition of `key` under this version's partition count
    pub fn route(&self, key: &[u8]) -> Result<PartitionId> {
        self.router.route(key, self.version.partition_count)
    }
}

/// Serving state of one subscribed store
pub struct StoreBackend {
    name: String,
    current: Arc<VersionRef<VersionBackend>>,
    subscription: SubscriptionSet,
    // Serializes subscription changes and promotions of this store
    op_lock: tokio::sync::Mutex<()>,
}

impl StoreBackend {
    fn new(name: &str, teardown: Teardown<VersionBackend>) -> Self {
        Self {
            name: name.to_string(),
            current: Arc::new(VersionRef::new(name, teardown)),
            subscription: SubscriptionSet::new(),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version serving reads
    pub fn current(&self) -> &Arc<VersionRef<VersionBackend>> {
        &self.current
    }

    pub fn subscription(&self) -> &SubscriptionSet {
        &self.subscription
    }

    /// Number of the installed version
    pub fn installed_version(&self) -> Option<VersionNumber> {
        self.current.borrow().ok().map(|handle| handle.version.number)
    }
}

/// Work queued by metadata listeners
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCommand {
    /// Serve `version` of `store`
    Promote {
        store: String,
        version: VersionNumber,
    },
    /// The store was deleted
    Retire { store: String },
}

/// Owns the store backends and moves them between versions
pub struct IngestionController {
    cache: Arc<MetadataCache>,
    storage: Arc<StorageService>,
    ingestion: Arc<dyn IngestionService>,
    backends: DashMap<String, Arc<StoreBackend>>,
    commands: mpsc::UnboundedSender<BackendCommand>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<BackendCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IngestionController {
    /// Create a controller and register it with the metadata cache
    pub fn new(
        cache: Arc<MetadataCache>,
        storage: Arc<StorageService>,
        ingestion: Arc<dyn IngestionService>,
    ) -> Arc<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let controller = Arc::new(Self {
            cache: Arc::clone(&cache),
            storage,
            ingestion,
            backends: DashMap::new(),
            commands,
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
        });
        cache.add_listener(Arc::new(PromotionListener {
            controller: Arc::downgrade(&controller),
        }));
        controller
    }

    /// Backend of `store`, if the client subscribed to it
    pub fn backend(&self, store: &str) -> Option<Arc<StoreBackend>> {
        self.backends.get(store).map(|b| Arc::clone(b.value()))
    }

    /// Stores with a backend, sorted by name
    pub fn stores(&self) -> Vec<String> {
        let mut stores: Vec<_> = self.backends.iter().map(|b| b.key().clone()).collect();
        stores.sort();
        stores
    }

    /// Number of the version serving reads of `store`
    pub fn installed_version(&self, store: &str) -> Option<VersionNumber> {
        self.backend(store)?.installed_version()
    }

    /// Subscribe partitions of `store`, installing its current version first
    ///
    /// Already subscribed partitions are left as they are.
    pub async fn subscribe(&self, store: &str, partitions: &[PartitionId]) -> Result<()> {
        let record = self.record(store)?;
        if record.current().is_none() && self.backend(store).is_none() {
            return Err(Error::NoReadyVersion {
                store: store.to_string(),
            });
        }
        let backend = self.backend_or_create(store);
        let _guard = backend.op_lock.lock().await;
        if !self.is_registered(store, &backend) {
            return Err(Error::StoreNotFound(store.to_string()));
        }

        if backend.current.current_generation().is_none() {
            let version = record.current().cloned().ok_or_else(|| Error::NoReadyVersion {
                store: store.to_string(),
            })?;
            self.install(&backend, version).await?;
        }
        let (version, engine) = {
            let handle = backend.current.borrow()?;
            (handle.version.clone(), Arc::clone(&handle.engine))
        };
        if let Some(p) = partitions.iter().find(|p| **p >= version.partition_count) {
            return Err(Error::invalid_argument(format!(
                "partition {p} out of range for {} partitions of store {store}",
                version.partition_count
            )));
        }

        let added = backend.subscription.subscribe(partitions.iter().copied());
        for partition in &added {
            if let Err(e) = self
                .ingestion
                .start_consumption(&version, Arc::clone(&engine), *partition)
                .await
            {
                backend.subscription.unsubscribe([*partition]);
                return Err(e);
            }
        }
        if !added.is_empty() {
            info!(
                "Subscribed partitions {:?} of store {} version {}",
                added, store, version.number
            );
        }
        Ok(())
    }

    /// Subscribe every partition of the current version of `store`
    pub async fn subscribe_all(&self, store: &str) -> Result<()> {
        let record = self.record(store)?;
        let count = record
            .current()
            .map(|v| v.partition_count)
            .ok_or_else(|| Error::NoReadyVersion {
                store: store.to_string(),
            })?;
        let partitions: Vec<_> = (0..count).collect();
        self.subscribe(store, &partitions).await
    }

    /// Unsubscribe partitions of `store`; unknown partitions are ignored
    pub async fn unsubscribe(&self, store: &str, partitions: &[PartitionId]) -> Result<()> {
        let Some(backend) = self.backend(store) else {
            return Ok(());
        };
        let _guard = backend.op_lock.lock().await;
        let removed = backend.subscription.unsubscribe(partitions.iter().copied());
        if removed.is_empty() {
            return Ok(());
        }

        let current = backend
            .current
            .borrow()
            .ok()
            .map(|handle| (handle.version.clone(), Arc::clone(&handle.engine)));
        if let Some((version, engine)) = current {
            for partition in &removed {
                self.ingestion
                    .stop_consumption(&version, Arc::clone(&engine), *partition)
                    .await?;
            }
        }
        info!("Unsubscribed partitions {:?} of store {}", removed, store);
        Ok(())
    }

    /// Serve `number` of `store` for its subscribed partitions
    ///
    /// A store without a backend has nothing to promote.
    pub async fn promote(&self, store: &str, number: VersionNumber) -> Result<()> {
        let Some(backend) = self.backend(store) else {
            return Ok(());
        };
        let record = self.record(store)?;
        let version = record.version(number).cloned().ok_or_else(|| {
            Error::invalid_argument(format!("store {store} has no version {number}"))
        })?;

        let _guard = backend.op_lock.lock().await;
        if !self.is_registered(store, &backend) || backend.installed_version() == Some(number) {
            return Ok(());
        }
        self.install(&backend, version).await
    }

    /// Drop the backend of `store`
    ///
    /// Waits for an install in progress. Its version is torn down once the
    /// last reader releases it.
    pub async fn retire(&self, store: &str) -> bool {
        let Some((_, backend)) = self.backends.remove(store) else {
            return false;
        };
        let _guard = backend.op_lock.lock().await;
        backend.subscription.clear();
        backend.current.retire_current();
        info!("Retired store {}", store);
        true
    }

    /// Apply queued commands without a worker, returning how many ran
    ///
    /// Returns 0 while the worker owns the queue.
    pub async fn process_commands(&self) -> usize {
        let Some(mut receiver) = self.receiver.lock().take() else {
            return 0;
        };
        let mut applied = 0;
        while let Ok(command) = receiver.try_recv() {
            self.apply(command).await;
            applied += 1;
        }
        *self.receiver.lock() = Some(receiver);
        applied
    }

    /// Start applying queued commands on the current tokio runtime
    pub fn start_worker(self: &Arc<Self>) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::internal(format!("ingestion worker needs a tokio runtime: {e}")))?;
        let Some(mut receiver) = self.receiver.lock().take() else {
            return Ok(());
        };

        let controller = Arc::downgrade(self);
        let worker = runtime.spawn(async move {
            while let Some(command) = receiver.recv().await {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.apply(command).await;
            }
            debug!("Ingestion worker stopped");
        });
        *self.worker.lock() = Some(worker);
        info!("Started ingestion worker");
        Ok(())
    }

    /// Stop the worker and drop every store backend
    ///
    /// Installed versions are left in storage for the next start; only
    /// versions already retired are still torn down when released.
    pub fn close(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        let released = self.backends.len();
        self.backends.clear();
        info!("Released {} store backends", released);
    }

    fn record(&self, store: &str) -> Result<Arc<StoreRecord>> {
        self.cache
            .get(store)
            .ok_or_else(|| Error::StoreNotFound(store.to_string()))
    }

    /// Whether `backend` still serves `store`, i.e. was not retired meanwhile
    fn is_registered(&self, store: &str, backend: &Arc<StoreBackend>) -> bool {
        self.backends
            .get(store)
            .is_some_and(|b| Arc::ptr_eq(b.value(), backend))
    }

    fn backend_or_create(&self, store: &str) -> Arc<StoreBackend> {
        let entry = self
            .backends
            .entry(store.to_string())
            .or_insert_with(|| Arc::new(StoreBackend::new(store, self.teardown())));
        Arc::clone(entry.value())
    }

    fn teardown(&self) -> Teardown<VersionBackend> {
        let storage = Arc::clone(&self.storage);
        Box::new(move |backend: Arc<VersionBackend>| {
            let location = backend.version.data_location();
            match storage.retire(&location) {
                Ok(()) => info!("Tore down {}", location),
                Err(e) => error!("Failed to tear down {}: {}", location, e),
            }
        })
    }

    async fn install(&self, backend: &StoreBackend, version: VersionRecord) -> Result<()> {
        let location = version.data_location();
        let engine = self.storage.open(&location)?;
        let router = PartitionerFactory::create(&version.partitioner_config)?;

        for partition in backend.subscription.partitions() {
            if partition >= version.partition_count {
                warn!(
                    "Store {} version {} has {} partitions, not serving subscribed partition {}",
                    backend.name, version.number, version.partition_count, partition
                );
                continue;
            }
            if let Err(e) = self
                .ingestion
                .start_consumption(&version, Arc::clone(&engine), partition)
                .await
            {
                error!("Failed to ingest {}: {}", location, e);
                if let Err(e) = self.storage.retire(&location) {
                    warn!("Failed to release {}: {}", location, e);
                }
                return Err(e);
            }
        }

        let number = version.number;
        backend.current.swap(VersionBackend {
            version,
            engine,
            router,
        });
        info!("Store {} now serving version {}", backend.name, number);
        Ok(())
    }

    async fn apply(&self, command: BackendCommand) {
        match command {
            BackendCommand::Promote { store, version } => {
                if let Err(e) = self.promote(&store, version).await {
                    error!("Failed to promote store {} to version {}: {}", store, version, e);
                }
            }
            BackendCommand::Retire { store } => {
                self.retire(&store).await;
            }
        }
    }

    fn enqueue(&self, command: BackendCommand) {
        debug!("Queued {:?}", command);
        if self.commands.send(command).is_err() {
            warn!("Ingestion command queue is closed");
        }
    }
}

impl Drop for IngestionController {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

/// Turns metadata changes into backend commands
struct PromotionListener {
    controller: Weak<IngestionController>,
}

impl PromotionListener {
    fn check(&self, store: &Arc<StoreRecord>) {
        let Some(controller) = self.controller.upgrade() else {
            return;
        };
        let Some(backend) = controller.backend(&store.name) else {
            return;
        };
        let Some(target) = store.current_version else {
            return;
        };
        if backend.installed_version() != Some(target) {
            controller.enqueue(BackendCommand::Promote {
                store: store.name.clone(),
                version: target,
            });
        }
    }
}

impl StoreChangeListener for PromotionListener {
    fn on_store_created(&self, store: &Arc<StoreRecord>) {
        self.check(store);
    }

    fn on_store_changed(&self, store: &Arc<StoreRecord>) {
        self.check(store);
    }

    fn on_store_deleted(&self, name: &str) {
        if let Some(controller) = self.controller.upgrade()
            && controller.backend(name).is_some()
        {
            controller.enqueue(BackendCommand::Retire {
                store: name.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_common::DataLocation;
    use tidepool_common::config::StorageConfig;
    use tidepool_meta::serializer::encode_store;
    use tidepool_meta::{InMemoryCoordinator, StorePaths};

    struct Fixture {
        coordinator: Arc<InMemoryCoordinator>,
        cache: Arc<MetadataCache>,
        storage: Arc<StorageService>,
        controller: Arc<IngestionController>,
    }

    impl Fixture {
        fn new() -> Self {
            let coordinator = Arc::new(InMemoryCoordinator::default());
            let cache = Arc::new(MetadataCache::new(coordinator.clone(), "test"));
            let storage = Arc::new(StorageService::new(StorageConfig::default()));
            let controller = IngestionController::new(
                Arc::clone(&cache),
                Arc::clone(&storage),
                Arc::new(LocalIngestion),
            );
            Self {
                coordinator,
                cache,
                storage,
                controller,
            }
        }

        fn publish(&self, record: &StoreRecord) {
            let path = StorePaths::new("test").store_path(&record.name);
            self.coordinator
                .put(&path, encode_store(record).unwrap())
                .unwrap();
        }
    }

    fn store(versions: &[u32], current: Option<u32>) -> StoreRecord {
        let mut record = StoreRecord::new("users");
        for &number in versions {
            record = record
                .with_version(VersionRecord::new("users", number, 4))
                .unwrap();
        }
        match current {
            Some(number) => record.with_current_version(number).unwrap(),
            None => record,
        }
    }

    #[tokio::test]
    async fn test_subscribe_installs_current_version() {
        let fixture = Fixture::new();
        fixture.publish(&store(&[1], Some(1)));
        fixture.cache.refresh().unwrap();

        fixture.controller.subscribe("users", &[0, 2]).await.unwrap();
        fixture.controller.subscribe("users", &[2]).await.unwrap();
        assert_eq!(fixture.controller.installed_version("users"), Some(1));

        let backend = fixture.controller.backend("users").unwrap();
        assert_eq!(backend.subscription().partitions(), vec![0, 2]);
        let engine = backend.current().borrow().unwrap().engine().clone();
        assert_eq!(engine.partition_ids(), vec![0, 2]);

        assert!(matches!(
            fixture.controller.subscribe("users", &[4]).await,
            Err(Error::InvalidArgument(_))
        ));
        fixture.controller.unsubscribe("users", &[0, 3]).await.unwrap();
        assert_eq!(engine.partition_ids(), vec![2]);
    }

    #[tokio::test]
    async fn test_subscribe_without_current_version() {
        let fixture = Fixture::new();
        fixture.publish(&store(&[], None));
        fixture.cache.refresh().unwrap();

        assert!(matches!(
            fixture.controller.subscribe("users", &[0]).await,
            Err(Error::NoReadyVersion { .. })
        ));
        assert!(matches!(
            fixture.controller.subscribe_all("users").await,
            Err(Error::NoReadyVersion { .. })
        ));
        assert!(matches!(
            fixture.controller.subscribe("orders", &[0]).await,
            Err(Error::StoreNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_new_current_version_is_promoted() {
        let fixture = Fixture::new();
        fixture.publish(&store(&[1], Some(1)));
        fixture.cache.refresh().unwrap();
        fixture.controller.subscribe_all("users").await.unwrap();

        let pinned = fixture
            .controller
            .backend("users")
            .unwrap()
            .current()
            .borrow()
            .unwrap();

        fixture.publish(&store(&[1, 2], Some(2)));
        assert_eq!(fixture.cache.process_pending(), 1);
        assert_eq!(fixture.controller.process_commands().await, 1);
        assert_eq!(fixture.controller.installed_version("users"), Some(2));

        let v1 = DataLocation::for_version("users", 1);
        let v2 = DataLocation::for_version("users", 2);
        assert_eq!(pinned.version().number, 1);
        assert!(fixture.storage.get(&v1).is_some());
        assert_eq!(
            fixture.storage.get(&v2).unwrap().partition_ids(),
            vec![0, 1, 2, 3]
        );

        drop(pinned);
        assert!(fixture.storage.get(&v1).is_none());
    }

    #[tokio::test]
    async fn test_rollback_keeps_pinned_version_storage() {
        let fixture = Fixture::new();
        fixture.publish(&store(&[1, 2], Some(1)));
        fixture.cache.refresh().unwrap();
        fixture.controller.subscribe_all("users").await.unwrap();

        let backend = fixture.controller.backend("users").unwrap();
        let pinned = backend.current().borrow().unwrap();
        fixture.controller.promote("users", 2).await.unwrap();
        fixture.controller.promote("users", 1).await.unwrap();
        assert_eq!(fixture.controller.installed_version("users"), Some(1));

        let v1 = DataLocation::for_version("users", 1);
        let engine = fixture.storage.get(&v1).unwrap();
        engine.put(0, b"k", b"v").unwrap();
        drop(pinned);

        assert!(fixture.storage.get(&v1).is_some());
        assert_eq!(engine.get(0, b"k").unwrap(), Some(b"v".to_vec()));
        assert!(
            fixture
                .storage
                .get(&DataLocation::for_version("users", 2))
                .is_none()
        );
        let current = backend.current().borrow().unwrap();
        assert!(Arc::ptr_eq(current.engine(), &engine));
    }

    #[tokio::test]
    async fn test_subscribe_racing_retire_installs_nothing() {
        let fixture = Fixture::new();
        fixture.publish(&store(&[1], Some(1)));
        fixture.cache.refresh().unwrap();
        fixture.controller.subscribe("users", &[0]).await.unwrap();

        let backend = fixture.controller.backend("users").unwrap();
        let guard = backend.op_lock.lock().await;
        let controller = Arc::clone(&fixture.controller);
        let subscribe = tokio::spawn(async move { controller.subscribe("users", &[1]).await });
        tokio::task::yield_now().await;
        let controller = Arc::clone(&fixture.controller);
        let retire = tokio::spawn(async move { controller.retire("users").await });
        tokio::task::yield_now().await;
        assert!(fixture.controller.backend("users").is_none());
        assert!(!retire.is_finished());

        drop(guard);
        assert!(matches!(
            subscribe.await.unwrap(),
            Err(Error::StoreNotFound(_))
        ));
        assert!(retire.await.unwrap());
        assert_eq!(backend.installed_version(), None);
        assert!(backend.subscription().is_empty());
        assert!(fixture.storage.locations().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_store_is_retired() {
        let fixture = Fixture::new();
        fixture.publish(&store(&[1], Some(1)));
        fixture.cache.refresh().unwrap();
        fixture.controller.subscribe("users", &[1]).await.unwrap();

        let path = StorePaths::new("test").store_path("users");
        assert!(fixture.coordinator.delete(&path).unwrap());
        fixture.cache.process_pending();
        fixture.controller.process_commands().await;

        assert!(fixture.controller.backend("users").is_none());
        assert!(
            fixture
                .storage
                .get(&DataLocation::for_version("users", 1))
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_unsubscribed_store_is_not_promoted() {
        let fixture = Fixture::new();
        fixture.publish(&store(&[1], Some(1)));
        fixture.cache.refresh().unwrap();

        fixture.publish(&store(&[1, 2], Some(2)));
        fixture.cache.process_pending();
        assert_eq!(fixture.controller.process_commands().await, 0);
        assert!(fixture.controller.backend("users").is_none());
        assert!(fixture.storage.locations().is_empty());
    }
}
