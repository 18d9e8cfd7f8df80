//! Watch-synchronized store metadata cache
//!
//! The cache holds one immutable [`StoreRecord`] per store behind a single
//! reader/writer lock. Every mutation goes through the apply mutex, which
//! serializes refreshes and notification handling; remote fetches happen
//! while holding only the apply mutex, and the write lock is held just long
//! enough to install the results.
//!
//! Each [`ChangeEvent`] names the watch it was delivered for. Events whose
//! watch the cache no longer holds are dropped, so a resync or a store
//! removal never lets a late notification resurrect old state.

use crate::coordinator::{ChangeEvent, ChangeKind, Coordinator, WatchId, WatchSink};
use crate::paths::StorePaths;
use crate::serializer::decode_store;
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tidepool_common::config::WatchMode;
use tidepool_common::{Error, Result, StoreRecord};
use tracing::{debug, error, info, warn};

/// How long the dispatcher waits for an event before checking for shutdown
const DISPATCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Observer of applied metadata changes
///
/// Callbacks run on the thread that applied the change, after the cache
/// lock is released. They must not call [`MetadataCache::refresh`] or the
/// `handle_*` methods.
pub trait StoreChangeListener: Send + Sync {
    /// A store appeared
    fn on_store_created(&self, _store: &Arc<StoreRecord>) {}

    /// A store's record was replaced with a different one
    fn on_store_changed(&self, _store: &Arc<StoreRecord>) {}

    /// A store was removed
    fn on_store_deleted(&self, _name: &str) {}
}

#[derive(Debug)]
enum StoreChange {
    Created(Arc<StoreRecord>),
    Changed(Arc<StoreRecord>),
    Deleted(String),
}

#[derive(Default)]
struct CacheState {
    stores: HashMap<String, Arc<StoreRecord>>,
    root_watch: Option<WatchId>,
    /// Data watch per known child; may name children whose record failed to load
    store_watches: HashMap<String, WatchId>,
    /// Ids of `store_watches`, for event filtering
    live_watches: HashSet<WatchId>,
}

impl CacheState {
    fn holds(&self, watch: WatchId) -> bool {
        self.root_watch == Some(watch) || self.live_watches.contains(&watch)
    }

    /// Record the data watch of `name`, returning the one it replaces
    fn track(&mut self, name: String, watch: WatchId) -> Option<WatchId> {
        self.live_watches.insert(watch);
        let previous = self.store_watches.insert(name, watch);
        if let Some(previous) = previous {
            self.live_watches.remove(&previous);
        }
        previous
    }

    fn untrack(&mut self, name: &str) -> Option<WatchId> {
        let watch = self.store_watches.remove(name)?;
        self.live_watches.remove(&watch);
        Some(watch)
    }

    fn untrack_all(&mut self) -> Vec<WatchId> {
        self.live_watches.clear();
        self.store_watches.drain().map(|(_, w)| w).collect()
    }
}

struct Snapshot {
    stores: HashMap<String, Arc<StoreRecord>>,
    root_watch: WatchId,
    store_watches: HashMap<String, WatchId>,
}

/// Local replica of the store records of one cluster
pub struct MetadataCache {
    coordinator: Arc<dyn Coordinator>,
    paths: StorePaths,
    state: RwLock<CacheState>,
    apply_lock: Mutex<()>,
    sink: WatchSink,
    events: Receiver<ChangeEvent>,
    listeners: RwLock<Vec<Arc<dyn StoreChangeListener>>>,
    shutdown: Arc<AtomicBool>,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MetadataCache {
    /// Create an empty cache for `cluster`
    pub fn new(coordinator: Arc<dyn Coordinator>, cluster: &str) -> Self {
        let (sink, events) = unbounded();
        Self {
            coordinator,
            paths: StorePaths::new(cluster),
            state: RwLock::new(CacheState::default()),
            apply_lock: Mutex::new(()),
            sink,
            events,
            listeners: RwLock::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            dispatcher: Mutex::new(None),
        }
    }

    /// Path layout used by this cache
    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Look up a store
    pub fn get(&self, name: &str) -> Option<Arc<StoreRecord>> {
        self.state.read().stores.get(name).cloned()
    }

    /// All cached stores ordered by name
    pub fn list(&self) -> Vec<Arc<StoreRecord>> {
        let mut stores: Vec<_> = self.state.read().stores.values().cloned().collect();
        stores.sort_by(|a, b| a.name.cmp(&b.name));
        stores
    }

    /// Number of cached stores
    pub fn len(&self) -> usize {
        self.state.read().stores.len()
    }

    /// Check if no store is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a listener for applied changes
    pub fn add_listener(&self, listener: Arc<dyn StoreChangeListener>) {
        self.listeners.write().push(listener);
    }

    /// Resynchronize with the coordination service
    ///
    /// Arms fresh watches, loads every store and installs the result in one
    /// step. On failure the previous snapshot and its watches are kept.
    pub fn refresh(&self) -> Result<()> {
        let _apply = self.apply_lock.lock();
        info!("Refreshing store metadata from {}", self.paths.root());

        let mut armed = Vec::new();
        let snapshot = match self.load_snapshot(&mut armed) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                for watch in armed {
                    self.coordinator.unwatch(watch);
                }
                warn!("Metadata refresh failed, keeping previous snapshot: {}", e);
                return Err(e);
            }
        };

        let (changes, stale) = {
            let mut state = self.state.write();
            let previous = std::mem::replace(&mut state.stores, snapshot.stores);
            let mut stale = state.untrack_all();
            stale.extend(state.root_watch.replace(snapshot.root_watch));
            for (name, watch) in snapshot.store_watches {
                state.track(name, watch);
            }
            (diff(&previous, &state.stores), stale)
        };
        for watch in stale {
            self.coordinator.unwatch(watch);
        }

        info!(
            "Refreshed store metadata: {} stores, {} changed",
            self.len(),
            changes.len()
        );
        self.notify(changes);
        Ok(())
    }

    fn load_snapshot(&self, armed: &mut Vec<WatchId>) -> Result<Snapshot> {
        let root = self.paths.root();
        let root_watch = self.coordinator.watch_children(root, &self.sink)?;
        armed.push(root_watch);

        let mut stores = HashMap::new();
        let mut store_watches = HashMap::new();
        for name in self.coordinator.children(root)? {
            if let Err(e) = StorePaths::validate_store_name(&name) {
                warn!("Ignoring child of {}: {}", root, e);
                continue;
            }
            let path = self.paths.store_path(&name);
            let watch = self.coordinator.watch_data(&path, &self.sink)?;
            armed.push(watch);

            let Some(bytes) = self.coordinator.read(&path)? else {
                debug!("Store {} vanished during refresh", name);
                self.coordinator.unwatch(watch);
                continue;
            };
            match self.decode(&path, &name, &bytes) {
                Ok(record) => {
                    stores.insert(name.clone(), Arc::new(record));
                }
                Err(e) => warn!("Skipping store {}: {}", name, e),
            }
            store_watches.insert(name, watch);
        }

        Ok(Snapshot {
            stores,
            root_watch,
            store_watches,
        })
    }

    /// Drop every store and release every watch
    pub fn clear(&self) {
        let _apply = self.apply_lock.lock();
        let watches: Vec<WatchId> = {
            let mut state = self.state.write();
            state.stores.clear();
            let mut watches = state.untrack_all();
            watches.extend(state.root_watch.take());
            watches
        };
        let released = watches.len();
        for watch in watches {
            self.coordinator.unwatch(watch);
        }
        info!("Cleared metadata cache, released {} watches", released);
    }

    /// Apply a change of the store list under `path`
    pub fn handle_child_change(&self, path: &str, children: &[String]) -> Result<()> {
        let _apply = self.apply_lock.lock();
        self.apply_children(path, children)
    }

    /// Apply new content of the store node at `path`
    pub fn handle_data_change(&self, path: &str, payload: &[u8]) -> Result<()> {
        let _apply = self.apply_lock.lock();
        self.apply_data(path, payload)
    }

    /// Apply the deletion of the store node at `path`
    pub fn handle_data_deleted(&self, path: &str) -> Result<()> {
        let _apply = self.apply_lock.lock();
        self.apply_deleted(path)
    }

    /// Apply one notification
    ///
    /// Returns `Ok(false)` when the event belongs to a watch the cache no
    /// longer holds. One-shot watches are re-armed before the change is
    /// applied, and the current remote state replaces the event payload so
    /// changes made before the re-arm are not lost.
    pub fn dispatch(&self, event: ChangeEvent) -> Result<bool> {
        let _apply = self.apply_lock.lock();
        if !self.state.read().holds(event.watch) {
            debug!("Dropping event for released {} on {}", event.watch, event.path);
            return Ok(false);
        }

        let one_shot = self.coordinator.watch_mode() == WatchMode::OneShot;
        match event.kind {
            ChangeKind::ChildrenChanged { children } => {
                let children = if one_shot {
                    self.rearm_root(&event.path).unwrap_or(children)
                } else {
                    children
                };
                self.apply_children(&event.path, &children)?;
            }
            ChangeKind::DataChanged { payload } => {
                let current = if one_shot {
                    match self.rearm_store(&event.path) {
                        Ok(current) => current,
                        Err(e) => {
                            warn!(
                                "Failed to re-arm watch on {}, applying notified state: {}",
                                event.path, e
                            );
                            Some(payload)
                        }
                    }
                } else {
                    Some(payload)
                };
                match current {
                    Some(payload) => self.apply_data(&event.path, &payload)?,
                    None => {
                        self.release_store_watch(&event.path);
                        self.apply_deleted(&event.path)?;
                    }
                }
            }
            ChangeKind::DataDeleted => {
                // the fired watch is gone; a re-created store is found again by child handling
                if one_shot {
                    self.release_store_watch(&event.path);
                }
                self.apply_deleted(&event.path)?;
            }
        }
        Ok(true)
    }

    /// Apply every queued notification on the calling thread
    ///
    /// Returns the number of events taken off the queue.
    pub fn process_pending(&self) -> usize {
        let mut processed = 0;
        while let Ok(event) = self.events.try_recv() {
            processed += 1;
            if let Err(e) = self.dispatch(event) {
                warn!("Dropped metadata notification: {}", e);
            }
        }
        processed
    }

    /// Start applying notifications on a background thread
    pub fn start_dispatcher(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.dispatcher.lock();
        if slot.is_some() {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let cache: Weak<Self> = Arc::downgrade(self);
        let events = self.events.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let handle = thread::Builder::new()
            .name("tidepool-meta-dispatch".to_string())
            .spawn(move || {
                info!("Metadata dispatcher started");
                while !shutdown.load(Ordering::SeqCst) {
                    match events.recv_timeout(DISPATCH_POLL_INTERVAL) {
                        Ok(event) => {
                            let Some(cache) = cache.upgrade() else {
                                break;
                            };
                            if let Err(e) = cache.dispatch(event) {
                                warn!("Dropped metadata notification: {}", e);
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Metadata dispatcher stopped");
            })?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stop the background dispatcher, waiting for the event in flight
    pub fn stop_dispatcher(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Metadata dispatcher panicked");
            }
        }
    }

    /// Stop dispatching and release every watch
    pub fn close(&self) {
        self.stop_dispatcher();
        self.clear();
    }

    fn decode(&self, path: &str, name: &str, bytes: &[u8]) -> Result<StoreRecord> {
        let record = decode_store(path, bytes)?;
        if record.name != name {
            return Err(Error::consistency(format!(
                "store record {} delivered on {}",
                record.name, path
            )));
        }
        Ok(record)
    }

    fn apply_children(&self, path: &str, children: &[String]) -> Result<()> {
        if path != self.paths.root() {
            return Err(Error::consistency(format!(
                "child change for {} but stores live under {}",
                path,
                self.paths.root()
            )));
        }

        let tracked: HashSet<String> = self.state.read().store_watches.keys().cloned().collect();
        let present: HashSet<&str> = children.iter().map(String::as_str).collect();
        let removed: Vec<String> = tracked
            .iter()
            .filter(|name| !present.contains(name.as_str()))
            .cloned()
            .collect();

        let mut fetched = Vec::new();
        for name in children.iter().filter(|c| !tracked.contains(c.as_str())) {
            if let Err(e) = StorePaths::validate_store_name(name) {
                warn!("Ignoring child of {}: {}", path, e);
                continue;
            }
            let store_path = self.paths.store_path(name);
            let watch = match self.coordinator.watch_data(&store_path, &self.sink) {
                Ok(watch) => watch,
                Err(e) => {
                    warn!("Failed to watch {}: {}", store_path, e);
                    continue;
                }
            };
            match self.coordinator.read(&store_path) {
                Ok(Some(bytes)) => {
                    let record = match self.decode(&store_path, name, &bytes) {
                        Ok(record) => Some(Arc::new(record)),
                        Err(e) => {
                            warn!("Skipping store {}: {}", name, e);
                            None
                        }
                    };
                    fetched.push((name.clone(), watch, record));
                }
                Ok(None) => {
                    debug!("Store {} vanished before it was fetched", name);
                    self.coordinator.unwatch(watch);
                }
                Err(e) => {
                    warn!("Failed to fetch store {}: {}", name, e);
                    self.coordinator.unwatch(watch);
                }
            }
        }

        let mut changes = Vec::new();
        let mut stale = Vec::new();
        {
            let mut state = self.state.write();
            for (name, watch, record) in fetched {
                stale.extend(state.track(name.clone(), watch));
                if let Some(record) = record {
                    info!("Store {} added", name);
                    state.stores.insert(name, Arc::clone(&record));
                    changes.push(StoreChange::Created(record));
                }
            }
            for name in removed {
                stale.extend(state.untrack(&name));
                if state.stores.remove(&name).is_some() {
                    info!("Store {} removed", name);
                    changes.push(StoreChange::Deleted(name));
                }
            }
        }
        for watch in stale {
            self.coordinator.unwatch(watch);
        }

        self.notify(changes);
        Ok(())
    }

    fn apply_data(&self, path: &str, payload: &[u8]) -> Result<()> {
        let name = self.paths.parse_store_name(path)?;
        let record = Arc::new(self.decode(path, name, payload)?);

        let change = {
            let mut state = self.state.write();
            match state.stores.insert(name.to_string(), Arc::clone(&record)) {
                Some(previous) if previous == record => None,
                Some(_) => Some(StoreChange::Changed(record)),
                None => Some(StoreChange::Created(record)),
            }
        };
        if let Some(change) = change {
            info!("Store {} updated", name);
            self.notify(vec![change]);
        }
        Ok(())
    }

    fn apply_deleted(&self, path: &str) -> Result<()> {
        let name = self.paths.parse_store_name(path)?;
        let removed = self.state.write().stores.remove(name).is_some();
        if removed {
            info!("Store {} deleted", name);
            self.notify(vec![StoreChange::Deleted(name.to_string())]);
        }
        Ok(())
    }

    /// Re-arm the consumed root watch and return the current child list
    fn rearm_root(&self, path: &str) -> Option<Vec<String>> {
        if path != self.paths.root() {
            return None;
        }
        match self.coordinator.watch_children(path, &self.sink) {
            Ok(watch) => {
                self.state.write().root_watch = Some(watch);
                self.coordinator.children(path).ok()
            }
            Err(e) => {
                warn!("Failed to re-arm watch on {}: {}", path, e);
                None
            }
        }
    }

    /// Re-arm the consumed data watch of a store and return its current content
    ///
    /// `Ok(None)` means the store no longer exists.
    fn rearm_store(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let name = self.paths.parse_store_name(path)?;
        let watch = self.coordinator.watch_data(path, &self.sink)?;
        let previous = self.state.write().track(name.to_string(), watch);
        if let Some(previous) = previous {
            self.coordinator.unwatch(previous);
        }
        self.coordinator.read(path)
    }

    /// Forget the data watch of the store at `path`
    fn release_store_watch(&self, path: &str) {
        let Ok(name) = self.paths.parse_store_name(path) else {
            return;
        };
        let released = self.state.write().untrack(name);
        if let Some(watch) = released {
            self.coordinator.unwatch(watch);
        }
    }

    fn notify(&self, changes: Vec<StoreChange>) {
        if changes.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for change in &changes {
            for listener in &listeners {
                match change {
                    StoreChange::Created(store) => listener.on_store_created(store),
                    StoreChange::Changed(store) => listener.on_store_changed(store),
                    StoreChange::Deleted(name) => listener.on_store_deleted(name),
                }
            }
        }
    }
}

impl Drop for MetadataCache {
    fn drop(&mut self) {
        self.stop_dispatcher();
    }
}

fn diff(
    previous: &HashMap<String, Arc<StoreRecord>>,
    current: &HashMap<String, Arc<StoreRecord>>,
) -> Vec<StoreChange> {
    let mut changes = Vec::new();
    for (name, record) in current {
        match previous.get(name) {
            None => changes.push(StoreChange::Created(Arc::clone(record))),
            Some(old) if old != record => changes.push(StoreChange::Changed(Arc::clone(record))),
            Some(_) => {}
        }
    }
    for name in previous.keys() {
        if !current.contains_key(name) {
            changes.push(StoreChange::Deleted(name.clone()));
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCoordinator;
    use crate::serializer::encode_store;
    use tidepool_common::VersionRecord;

    fn store(name: &str, version: u32, partitions: u32) -> StoreRecord {
        StoreRecord::new(name)
            .with_version(VersionRecord::new(name, version, partitions))
            .unwrap()
            .with_current_version(version)
            .unwrap()
    }

    fn publish(coordinator: &InMemoryCoordinator, record: &StoreRecord) {
        let path = StorePaths::new("test").store_path(&record.name);
        coordinator
            .put(&path, encode_store(record).unwrap())
            .unwrap();
    }

    fn setup(mode: WatchMode) -> (Arc<InMemoryCoordinator>, Arc<MetadataCache>) {
        let coordinator = Arc::new(InMemoryCoordinator::new(mode));
        let cache = Arc::new(MetadataCache::new(
            Arc::clone(&coordinator) as Arc<dyn Coordinator>,
            "test",
        ));
        (coordinator, cache)
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl StoreChangeListener for Recorder {
        fn on_store_created(&self, store: &Arc<StoreRecord>) {
            self.seen.lock().push(format!("created:{}", store.name));
        }

        fn on_store_changed(&self, store: &Arc<StoreRecord>) {
            self.seen.lock().push(format!("changed:{}", store.name));
        }

        fn on_store_deleted(&self, name: &str) {
            self.seen.lock().push(format!("deleted:{name}"));
        }
    }

    #[test]
    fn test_refresh_loads_stores_and_watches() {
        let (coordinator, cache) = setup(WatchMode::Persistent);
        publish(&coordinator, &store("users", 1, 4));
        publish(&coordinator, &store("orders", 2, 8));

        cache.refresh().unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("orders").unwrap().current_version, Some(2));
        let names: Vec<_> = cache.list().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["orders", "users"]);
        assert_eq!(coordinator.watch_count(), 3);

        // A second refresh replaces the watches instead of adding to them
        cache.refresh().unwrap();
        assert_eq!(coordinator.watch_count(), 3);
    }

    #[test]
    fn test_refresh_failure_keeps_stale_snapshot() {
        let (coordinator, cache) = setup(WatchMode::Persistent);
        publish(&coordinator, &store("users", 1, 4));
        cache.refresh().unwrap();

        publish(&coordinator, &store("orders", 1, 2));
        cache.process_pending();
        coordinator.set_available(false);
        assert!(matches!(cache.refresh(), Err(Error::Coordination(_))));
        assert_eq!(cache.len(), 2);
        coordinator.set_available(true);

        coordinator.fail_reads_of("/test/Stores/orders", true);
        publish(&coordinator, &store("users", 2, 4));
        assert!(cache.refresh().is_err());
        // Old snapshot kept, freshly armed watches released
        assert_eq!(cache.get("users").unwrap().current_version, Some(1));
        assert_eq!(coordinator.watch_count(), 3);
    }

    #[test]
    fn test_refresh_skips_invalid_records() {
        let (coordinator, cache) = setup(WatchMode::Persistent);
        publish(&coordinator, &store("users", 1, 4));
        coordinator
            .put("/test/Stores/broken", b"{\"oops\":true}".to_vec())
            .unwrap();

        cache.refresh().unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("broken").is_none());

        // The watch stays so a corrected record is picked up
        publish(&coordinator, &store("broken", 1, 1));
        cache.process_pending();
        assert!(cache.get("broken").is_some());
    }

    #[test]
    fn test_child_added_and_data_changed() {
        let (coordinator, cache) = setup(WatchMode::Persistent);
        let recorder = Arc::new(Recorder::default());
        cache.add_listener(Arc::clone(&recorder) as Arc<dyn StoreChangeListener>);
        cache.refresh().unwrap();

        publish(&coordinator, &store("users", 1, 4));
        assert_eq!(cache.process_pending(), 1);
        assert_eq!(cache.get("users").unwrap().versions.len(), 1);
        assert_eq!(coordinator.watches_on("/test/Stores/users"), 1);

        let updated = store("users", 1, 4)
            .with_version(VersionRecord::new("users", 2, 4))
            .unwrap()
            .with_current_version(2)
            .unwrap();
        publish(&coordinator, &updated);
        cache.process_pending();
        assert_eq!(cache.get("users").unwrap().current_version, Some(2));

        assert_eq!(
            *recorder.seen.lock(),
            vec!["created:users".to_string(), "changed:users".to_string()]
        );
    }

    #[test]
    fn test_data_change_is_idempotent() {
        let (coordinator, cache) = setup(WatchMode::Persistent);
        publish(&coordinator, &store("users", 1, 4));
        cache.refresh().unwrap();
        let recorder = Arc::new(Recorder::default());
        cache.add_listener(Arc::clone(&recorder) as Arc<dyn StoreChangeListener>);

        let payload = encode_store(&store("users", 1, 16).without_version(1)).unwrap();
        cache.handle_data_change("/test/Stores/users", &payload).unwrap();
        let once = cache.get("users").unwrap();
        cache.handle_data_change("/test/Stores/users", &payload).unwrap();
        let twice = cache.get("users").unwrap();

        assert_eq!(once, twice);
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[test]
    fn test_consistency_errors_leave_cache_usable() {
        let (coordinator, cache) = setup(WatchMode::Persistent);
        publish(&coordinator, &store("users", 1, 4));
        cache.refresh().unwrap();

        let orders = encode_store(&store("orders", 1, 4)).unwrap();
        assert!(matches!(
            cache.handle_data_change("/test/Stores/users", &orders),
            Err(Error::Consistency(_))
        ));
        assert!(matches!(
            cache.handle_child_change("/other/Stores", &[]),
            Err(Error::Consistency(_))
        ));
        assert!(matches!(
            cache.handle_data_deleted("/test/Stores"),
            Err(Error::Consistency(_))
        ));
        assert_eq!(cache.get("users").unwrap().name, "users");
    }

    #[test]
    fn test_store_deletion_releases_watch() {
        let (coordinator, cache) = setup(WatchMode::Persistent);
        let recorder = Arc::new(Recorder::default());
        publish(&coordinator, &store("users", 1, 4));
        cache.refresh().unwrap();
        cache.add_listener(Arc::clone(&recorder) as Arc<dyn StoreChangeListener>);

        coordinator.delete("/test/Stores/users").unwrap();
        assert_eq!(cache.process_pending(), 2);
        assert!(cache.get("users").is_none());
        assert_eq!(coordinator.watches_on("/test/Stores/users"), 0);
        assert_eq!(*recorder.seen.lock(), vec!["deleted:users".to_string()]);

        // A late notification on the released watch is not applied
        let late = ChangeEvent::new(
            WatchId(2),
            "/test/Stores/users",
            ChangeKind::DataChanged {
                payload: encode_store(&store("users", 1, 4)).unwrap(),
            },
        );
        assert!(!cache.dispatch(late).unwrap());
        assert!(cache.get("users").is_none());
    }

    #[test]
    fn test_events_from_replaced_watches_are_dropped() {
        let (coordinator, cache) = setup(WatchMode::Persistent);
        cache.refresh().unwrap();
        let old_root = cache.state.read().root_watch.unwrap();
        cache.refresh().unwrap();

        let event = ChangeEvent::new(
            old_root,
            "/test/Stores",
            ChangeKind::ChildrenChanged {
                children: vec!["ghost".into()],
            },
        );
        assert!(!cache.dispatch(event).unwrap());
        assert_eq!(coordinator.watch_count(), 1);
    }

    #[test]
    fn test_one_shot_watches_are_rearmed() {
        let (coordinator, cache) = setup(WatchMode::OneShot);
        cache.refresh().unwrap();

        publish(&coordinator, &store("users", 1, 4));
        cache.process_pending();
        publish(&coordinator, &store("orders", 1, 4));
        cache.process_pending();
        assert_eq!(cache.len(), 2);

        for partitions in [8, 16] {
            publish(&coordinator, &store("users", 1, partitions));
            cache.process_pending();
            assert_eq!(cache.get("users").unwrap().versions[0].partition_count, partitions);
        }
        assert_eq!(coordinator.watches_on("/test/Stores"), 1);
        assert_eq!(coordinator.watches_on("/test/Stores/users"), 1);
    }

    #[test]
    fn test_one_shot_store_recreated_after_delete() {
        let (coordinator, cache) = setup(WatchMode::OneShot);
        publish(&coordinator, &store("users", 1, 4));
        cache.refresh().unwrap();

        // Both watches fire on the delete, so the re-create notifies nobody
        coordinator.delete("/test/Stores/users").unwrap();
        publish(&coordinator, &store("users", 2, 4));
        cache.process_pending();
        cache.process_pending();

        assert_eq!(cache.get("users").unwrap().current_version, Some(2));
        assert_eq!(coordinator.watches_on("/test/Stores/users"), 1);
        assert_eq!(coordinator.watches_on("/test/Stores"), 1);

        publish(&coordinator, &store("users", 3, 4));
        cache.process_pending();
        assert_eq!(cache.get("users").unwrap().current_version, Some(3));
    }

    #[test]
    fn test_one_shot_change_of_deleted_store_is_not_applied() {
        let (coordinator, cache) = setup(WatchMode::OneShot);
        let recorder = Arc::new(Recorder::default());
        publish(&coordinator, &store("users", 1, 4));
        cache.refresh().unwrap();
        cache.add_listener(Arc::clone(&recorder) as Arc<dyn StoreChangeListener>);

        publish(&coordinator, &store("users", 1, 8));
        coordinator.delete("/test/Stores/users").unwrap();
        cache.process_pending();

        assert!(cache.get("users").is_none());
        assert_eq!(*recorder.seen.lock(), vec!["deleted:users".to_string()]);
        assert_eq!(coordinator.watches_on("/test/Stores/users"), 0);
    }

    #[test]
    fn test_clear_releases_everything() {
        let (coordinator, cache) = setup(WatchMode::Persistent);
        publish(&coordinator, &store("users", 1, 4));
        cache.refresh().unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(coordinator.watch_count(), 0);
    }

    #[test]
    fn test_readers_never_see_torn_records() {
        let (coordinator, cache) = setup(WatchMode::Persistent);
        let generation = |i: u32| {
            let mut record = store("users", 1, i);
            record.owner = format!("owner-{i}");
            record
        };
        publish(&coordinator, &generation(1));
        cache.refresh().unwrap();
        cache.start_dispatcher().unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        if let Some(record) = cache.get("users") {
                            let count = record.versions[0].partition_count;
                            assert_eq!(record.owner, format!("owner-{count}"));
                        }
                    }
                })
            })
            .collect();

        for i in 2..=200 {
            publish(&coordinator, &generation(i));
            if i % 50 == 0 {
                cache.refresh().unwrap();
            }
        }
        done.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }

        cache.stop_dispatcher();
        cache.process_pending();
        assert_eq!(cache.get("users").unwrap().owner, "owner-200");
    }
}
