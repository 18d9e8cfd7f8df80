//! In-process coordination service
//!
//! Holds the node tree in memory and delivers watch notifications on the
//! registered channels. Used by tests, by the CLI when it works from a
//! metadata snapshot, and by single-node deployments.

use crate::coordinator::{ChangeEvent, ChangeKind, Coordinator, WatchId, WatchSink};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tidepool_common::config::WatchMode;
use tidepool_common::{Error, Result};
use tracing::{debug, trace};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WatchTarget {
    Children,
    Data,
}

struct Registration {
    path: String,
    target: WatchTarget,
    sink: WatchSink,
}

/// Coordination service kept entirely in memory
pub struct InMemoryCoordinator {
    mode: WatchMode,
    nodes: RwLock<BTreeMap<String, Vec<u8>>>,
    watches: Mutex<HashMap<WatchId, Registration>>,
    next_watch: AtomicU64,
    available: AtomicBool,
    closed: AtomicBool,
    failing_reads: Mutex<HashSet<String>>,
}

impl InMemoryCoordinator {
    /// Create an empty tree with the given watch contract
    pub fn new(mode: WatchMode) -> Self {
        Self {
            mode,
            nodes: RwLock::new(BTreeMap::new()),
            watches: Mutex::new(HashMap::new()),
            next_watch: AtomicU64::new(1),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            failing_reads: Mutex::new(HashSet::new()),
        }
    }

    /// Create or replace the node at `path`
    ///
    /// A new node notifies child watchers of its parent, a replaced node
    /// notifies data watchers of the node itself.
    pub fn put(&self, path: &str, payload: Vec<u8>) -> Result<()> {
        self.check_available()?;
        let (created, children) = {
            let mut nodes = self.nodes.write();
            let created = nodes.insert(path.to_string(), payload.clone()).is_none();
            let children = parent(path).map(|p| list_children(&nodes, p));
            (created, children)
        };

        if created {
            if let (Some(dir), Some(children)) = (parent(path), children) {
                self.fire(dir, WatchTarget::Children, |_| ChangeKind::ChildrenChanged {
                    children: children.clone(),
                });
            }
        } else {
            self.fire(path, WatchTarget::Data, |_| ChangeKind::DataChanged {
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    /// Delete the node at `path`; returns whether it existed
    pub fn delete(&self, path: &str) -> Result<bool> {
        self.check_available()?;
        let children = {
            let mut nodes = self.nodes.write();
            if nodes.remove(path).is_none() {
                return Ok(false);
            }
            parent(path).map(|p| list_children(&nodes, p))
        };

        self.fire(path, WatchTarget::Data, |_| ChangeKind::DataDeleted);
        if let (Some(dir), Some(children)) = (parent(path), children) {
            self.fire(dir, WatchTarget::Children, |_| ChangeKind::ChildrenChanged {
                children: children.clone(),
            });
        }
        Ok(true)
    }

    /// Simulate losing or regaining the connection
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make reads of `path` fail while the connection stays up
    pub fn fail_reads_of(&self, path: &str, fail: bool) {
        let mut failing = self.failing_reads.lock();
        if fail {
            failing.insert(path.to_string());
        } else {
            failing.remove(path);
        }
    }

    /// Number of live watch registrations
    pub fn watch_count(&self) -> usize {
        self.watches.lock().len()
    }

    /// Number of live watch registrations on `path`
    pub fn watches_on(&self, path: &str) -> usize {
        self.watches
            .lock()
            .values()
            .filter(|r| r.path == path)
            .count()
    }

    fn check_available(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::coordination("connection closed"));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::coordination("coordination service unavailable"));
        }
        Ok(())
    }

    fn register(&self, path: &str, target: WatchTarget, sink: &WatchSink) -> Result<WatchId> {
        self.check_available()?;
        let id = WatchId(self.next_watch.fetch_add(1, Ordering::SeqCst));
        self.watches.lock().insert(
            id,
            Registration {
                path: path.to_string(),
                target,
                sink: sink.clone(),
            },
        );
        trace!("Registered {} on {} ({:?})", id, path, target);
        Ok(id)
    }

    /// Deliver an event to every matching watch, outside all locks
    fn fire(&self, path: &str, target: WatchTarget, kind: impl Fn(WatchId) -> ChangeKind) {
        let deliveries: Vec<(WatchId, WatchSink)> = {
            let mut watches = self.watches.lock();
            let matched: Vec<WatchId> = watches
                .iter()
                .filter(|(_, r)| r.path == path && r.target == target)
                .map(|(id, _)| *id)
                .collect();
            matched
                .into_iter()
                .filter_map(|id| {
                    if self.mode == WatchMode::OneShot {
                        watches.remove(&id).map(|r| (id, r.sink))
                    } else {
                        watches.get(&id).map(|r| (id, r.sink.clone()))
                    }
                })
                .collect()
        };

        for (id, sink) in deliveries {
            if sink.send(ChangeEvent::new(id, path, kind(id))).is_err() {
                debug!("Receiver for {} on {} is gone, dropping watch", id, path);
                self.watches.lock().remove(&id);
            }
        }
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new(WatchMode::Persistent)
    }
}

impl Coordinator for InMemoryCoordinator {
    fn watch_mode(&self) -> WatchMode {
        self.mode
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(list_children(&self.nodes.read(), path))
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        if self.failing_reads.lock().contains(path) {
            return Err(Error::coordination(format!("read of {path} failed")));
        }
        Ok(self.nodes.read().get(path).cloned())
    }

    fn watch_children(&self, path: &str, sink: &WatchSink) -> Result<WatchId> {
        self.register(path, WatchTarget::Children, sink)
    }

    fn watch_data(&self, path: &str, sink: &WatchSink) -> Result<WatchId> {
        self.register(path, WatchTarget::Data, sink)
    }

    fn unwatch(&self, watch: WatchId) {
        self.watches.lock().remove(&watch);
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.watches.lock().clear();
        Ok(())
    }
}

fn parent(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some(("", _)) | None => None,
        Some((parent, _)) => Some(parent),
    }
}

fn list_children(nodes: &BTreeMap<String, Vec<u8>>, path: &str) -> Vec<String> {
    let prefix = format!("{path}/");
    nodes
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .filter_map(|(k, _)| {
            let rest = &k[prefix.len()..];
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_children_and_read() {
        let coordinator = InMemoryCoordinator::default();
        coordinator.put("/c/Stores/a", b"1".to_vec()).unwrap();
        coordinator.put("/c/Stores/b", b"2".to_vec()).unwrap();
        coordinator.put("/c/Stores/b/deep", b"3".to_vec()).unwrap();
        coordinator.put("/c/Storesx", b"4".to_vec()).unwrap();

        assert_eq!(coordinator.children("/c/Stores").unwrap(), vec!["a", "b"]);
        assert_eq!(coordinator.read("/c/Stores/a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(coordinator.read("/c/Stores/z").unwrap(), None);
        assert!(coordinator.children("/missing").unwrap().is_empty());
    }

    #[test]
    fn test_persistent_watches_keep_firing() {
        let coordinator = InMemoryCoordinator::new(WatchMode::Persistent);
        let (tx, rx) = unbounded();
        let root = coordinator.watch_children("/c/Stores", &tx).unwrap();
        coordinator.put("/c/Stores/a", b"1".to_vec()).unwrap();
        let data = coordinator.watch_data("/c/Stores/a", &tx).unwrap();
        coordinator.put("/c/Stores/a", b"2".to_vec()).unwrap();
        coordinator.put("/c/Stores/a", b"3".to_vec()).unwrap();
        coordinator.delete("/c/Stores/a").unwrap();

        let events: Vec<ChangeEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].watch, root);
        assert_eq!(
            events[0].kind,
            ChangeKind::ChildrenChanged {
                children: vec!["a".into()]
            }
        );
        assert_eq!(events[1].watch, data);
        assert_eq!(events[3].kind, ChangeKind::DataDeleted);
        assert_eq!(
            events[4].kind,
            ChangeKind::ChildrenChanged { children: vec![] }
        );
        assert_eq!(coordinator.watch_count(), 2);
    }

    #[test]
    fn test_one_shot_watches_fire_once() {
        let coordinator = InMemoryCoordinator::new(WatchMode::OneShot);
        let (tx, rx) = unbounded();
        coordinator.put("/c/Stores/a", b"1".to_vec()).unwrap();
        coordinator.watch_data("/c/Stores/a", &tx).unwrap();
        coordinator.put("/c/Stores/a", b"2".to_vec()).unwrap();
        coordinator.put("/c/Stores/a", b"3".to_vec()).unwrap();

        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(coordinator.watch_count(), 0);
    }

    #[test]
    fn test_unwatch_and_unavailable() {
        let coordinator = InMemoryCoordinator::default();
        let (tx, rx) = unbounded();
        let id = coordinator.watch_children("/c/Stores", &tx).unwrap();
        coordinator.unwatch(id);
        coordinator.put("/c/Stores/a", b"1".to_vec()).unwrap();
        assert!(rx.try_recv().is_err());

        coordinator.set_available(false);
        assert!(matches!(
            coordinator.children("/c/Stores"),
            Err(Error::Coordination(_))
        ));
        coordinator.set_available(true);
        coordinator.fail_reads_of("/c/Stores/a", true);
        assert!(coordinator.read("/c/Stores/a").is_err());
        assert!(coordinator.read("/c/Stores/b").is_ok());
    }
}
