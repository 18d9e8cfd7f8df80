//! Heap-backed storage engine

use crate::engine::StorageEngine;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tidepool_common::{DataLocation, PartitionId};

type Partition = HashMap<Vec<u8>, Vec<u8>>;

/// Storage engine keeping all partitions in memory
pub struct MemoryStorageEngine {
    location: DataLocation,
    partitions: RwLock<BTreeMap<PartitionId, Partition>>,
    closed: AtomicBool,
}

impl MemoryStorageEngine {
    pub fn new(location: DataLocation) -> Self {
        Self {
            location,
            partitions: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed(self.location.clone()));
        }
        Ok(())
    }

    fn missing(&self, partition: PartitionId) -> StorageError {
        StorageError::PartitionMissing {
            location: self.location.clone(),
            partition,
        }
    }
}

impl StorageEngine for MemoryStorageEngine {
    fn location(&self) -> &DataLocation {
        &self.location
    }

    fn add_partition(&self, partition: PartitionId) -> StorageResult<()> {
        self.check_open()?;
        self.partitions.write().entry(partition).or_default();
        Ok(())
    }

    fn drop_partition(&self, partition: PartitionId) -> StorageResult<()> {
        self.check_open()?;
        self.partitions.write().remove(&partition);
        Ok(())
    }

    fn has_partition(&self, partition: PartitionId) -> bool {
        self.partitions.read().contains_key(&partition)
    }

    fn partition_ids(&self) -> Vec<PartitionId> {
        self.partitions.read().keys().copied().collect()
    }

    fn get(&self, partition: PartitionId, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.check_open()?;
        let partitions = self.partitions.read();
        let data = partitions.get(&partition).ok_or_else(|| self.missing(partition))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, partition: PartitionId, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.check_open()?;
        let mut partitions = self.partitions.write();
        let data = partitions
            .get_mut(&partition)
            .ok_or_else(|| self.missing(partition))?;
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, partition: PartitionId, key: &[u8]) -> StorageResult<()> {
        self.check_open()?;
        let mut partitions = self.partitions.write();
        let data = partitions
            .get_mut(&partition)
            .ok_or_else(|| self.missing(partition))?;
        data.remove(key);
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.partitions.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitions_are_independent() {
        let engine = MemoryStorageEngine::new(DataLocation::for_version("s", 1));
        engine.add_partition(0).unwrap();
        engine.add_partition(1).unwrap();
        engine.put(0, b"k", b"zero").unwrap();

        assert_eq!(engine.get(0, b"k").unwrap(), Some(b"zero".to_vec()));
        assert_eq!(engine.get(1, b"k").unwrap(), None);
        assert!(matches!(
            engine.get(2, b"k"),
            Err(StorageError::PartitionMissing { partition: 2, .. })
        ));
        assert_eq!(engine.partition_ids(), vec![0, 1]);

        engine.delete(0, b"k").unwrap();
        assert_eq!(engine.get(0, b"k").unwrap(), None);
    }

    #[test]
    fn test_add_partition_keeps_data() {
        let engine = MemoryStorageEngine::new(DataLocation::for_version("s", 1));
        engine.add_partition(3).unwrap();
        engine.put(3, b"k", b"v").unwrap();
        engine.add_partition(3).unwrap();
        assert_eq!(engine.get(3, b"k").unwrap(), Some(b"v".to_vec()));

        engine.drop_partition(3).unwrap();
        assert!(!engine.has_partition(3));
    }

    #[test]
    fn test_closed_engine_rejects_calls() {
        let engine = MemoryStorageEngine::new(DataLocation::for_version("s", 1));
        engine.add_partition(0).unwrap();
        engine.close().unwrap();
        assert!(matches!(engine.get(0, b"k"), Err(StorageError::Closed(_))));
    }
}
