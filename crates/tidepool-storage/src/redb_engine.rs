//! Storage engine backed by redb
//!
//! One database file per data location, one table per partition. Every
//! write is its own committed transaction.

use crate::engine::StorageEngine;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition, TableError, TableHandle};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tidepool_common::{DataLocation, PartitionId};
use tracing::{debug, info, warn};

const TABLE_PREFIX: &str = "partition_";

fn table_name(partition: PartitionId) -> String {
    format!("{TABLE_PREFIX}{partition}")
}

fn partition_table(name: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    TableDefinition::new(name)
}

/// Storage engine persisting one location in a redb file
pub struct RedbStorageEngine {
    location: DataLocation,
    path: PathBuf,
    db: RwLock<Option<Database>>,
    partitions: RwLock<BTreeSet<PartitionId>>,
}

impl RedbStorageEngine {
    /// File holding `location` under `data_dir`
    pub fn file_path(data_dir: &Path, location: &DataLocation) -> PathBuf {
        data_dir.join(format!("{location}.redb"))
    }

    /// Open (or create) the database for `location` under `data_dir`
    pub fn open(data_dir: impl AsRef<Path>, location: DataLocation) -> StorageResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let path = Self::file_path(data_dir, &location);
        let db = Database::create(&path)?;

        let partitions: BTreeSet<PartitionId> = {
            let read_txn = db.begin_read()?;
            read_txn
                .list_tables()?
                .filter_map(|handle| {
                    handle
                        .name()
                        .strip_prefix(TABLE_PREFIX)
                        .and_then(|p| p.parse().ok())
                })
                .collect()
        };
        info!(
            "Opened {} at {:?} with {} partitions",
            location,
            path,
            partitions.len()
        );

        Ok(Self {
            location,
            path,
            db: RwLock::new(Some(db)),
            partitions: RwLock::new(partitions),
        })
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> StorageResult<T>) -> StorageResult<T> {
        let guard = self.db.read();
        let db = guard
            .as_ref()
            .ok_or_else(|| StorageError::Closed(self.location.clone()))?;
        f(db)
    }

    fn check_partition(&self, partition: PartitionId) -> StorageResult<()> {
        if self.has_partition(partition) {
            Ok(())
        } else {
            Err(StorageError::PartitionMissing {
                location: self.location.clone(),
                partition,
            })
        }
    }
}

impl StorageEngine for RedbStorageEngine {
    fn location(&self) -> &DataLocation {
        &self.location
    }

    fn add_partition(&self, partition: PartitionId) -> StorageResult<()> {
        let name = table_name(partition);
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            {
                let _t = write_txn.open_table(partition_table(&name))?;
            }
            write_txn.commit()?;
            Ok(())
        })?;
        self.partitions.write().insert(partition);
        debug!("Added partition {} to {}", partition, self.location);
        Ok(())
    }

    fn drop_partition(&self, partition: PartitionId) -> StorageResult<()> {
        let name = table_name(partition);
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            write_txn.delete_table(partition_table(&name))?;
            write_txn.commit()?;
            Ok(())
        })?;
        self.partitions.write().remove(&partition);
        debug!("Dropped partition {} from {}", partition, self.location);
        Ok(())
    }

    fn has_partition(&self, partition: PartitionId) -> bool {
        self.partitions.read().contains(&partition)
    }

    fn partition_ids(&self) -> Vec<PartitionId> {
        self.partitions.read().iter().copied().collect()
    }

    fn get(&self, partition: PartitionId, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.check_partition(partition)?;
        let name = table_name(partition);
        self.with_db(|db| {
            let read_txn = db.begin_read()?;
            let table = match read_txn.open_table(partition_table(&name)) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => {
                    return Err(StorageError::PartitionMissing {
                        location: self.location.clone(),
                        partition,
                    });
                }
                Err(e) => return Err(e.into()),
            };
            Ok(table.get(key)?.map(|v| v.value().to_vec()))
        })
    }

    fn put(&self, partition: PartitionId, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.check_partition(partition)?;
        let name = table_name(partition);
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(partition_table(&name))?;
                table.insert(key, value)?;
            }
            write_txn.commit()?;
            Ok(())
        })
    }

    fn delete(&self, partition: PartitionId, key: &[u8]) -> StorageResult<()> {
        self.check_partition(partition)?;
        let name = table_name(partition);
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(partition_table(&name))?;
                table.remove(key)?;
            }
            write_txn.commit()?;
            Ok(())
        })
    }

    fn close(&self) -> StorageResult<()> {
        if self.db.write().take().is_some() {
            info!("Closed {}", self.location);
        }
        Ok(())
    }

    fn destroy(&self) -> StorageResult<()> {
        self.close()?;
        self.partitions.write().clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Removed data of {} at {:?}", self.location, self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Data of {} already removed", self.location);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RedbStorageEngine::open(dir.path(), DataLocation::for_version("s", 1)).unwrap();
        engine.add_partition(2).unwrap();
        engine.put(2, b"k", b"v").unwrap();

        assert_eq!(engine.get(2, b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(engine.get(2, b"other").unwrap(), None);
        assert!(matches!(
            engine.get(0, b"k"),
            Err(StorageError::PartitionMissing { partition: 0, .. })
        ));

        engine.delete(2, b"k").unwrap();
        assert_eq!(engine.get(2, b"k").unwrap(), None);
    }

    #[test]
    fn test_reopen_discovers_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let location = DataLocation::for_version("s", 3);
        {
            let engine = RedbStorageEngine::open(dir.path(), location.clone()).unwrap();
            engine.add_partition(0).unwrap();
            engine.add_partition(5).unwrap();
            engine.put(5, b"k", b"v").unwrap();
            engine.close().unwrap();
        }

        let engine = RedbStorageEngine::open(dir.path(), location).unwrap();
        assert_eq!(engine.partition_ids(), vec![0, 5]);
        assert_eq!(engine.get(5, b"k").unwrap(), Some(b"v".to_vec()));

        engine.drop_partition(0).unwrap();
        assert_eq!(engine.partition_ids(), vec![5]);
    }

    #[test]
    fn test_destroy_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RedbStorageEngine::open(dir.path(), DataLocation::for_version("s", 1)).unwrap();
        engine.add_partition(0).unwrap();
        assert!(engine.path().exists());

        engine.destroy().unwrap();
        assert!(!engine.path().exists());
        assert!(matches!(engine.get(0, b"k"), Err(StorageError::PartitionMissing { .. })));
        assert!(matches!(engine.add_partition(0), Err(StorageError::Closed(_))));
    }
}
