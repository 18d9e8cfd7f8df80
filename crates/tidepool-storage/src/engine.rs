//! Storage engine interface

use crate::error::StorageResult;
use tidepool_common::{DataLocation, PartitionId};

/// Partitioned byte-keyed store holding one version's data
///
/// Partitions are created by ingestion when a partition is subscribed.
/// Reading or writing a partition that was never added fails with
/// `StorageError::PartitionMissing`.
pub trait StorageEngine: Send + Sync {
    /// Location whose data this engine holds
    fn location(&self) -> &DataLocation;

    /// Create an empty partition; existing partitions are kept
    fn add_partition(&self, partition: PartitionId) -> StorageResult<()>;

    /// Drop a partition and its data
    fn drop_partition(&self, partition: PartitionId) -> StorageResult<()>;

    /// Check if a partition exists
    fn has_partition(&self, partition: PartitionId) -> bool;

    /// Present partitions in ascending order
    fn partition_ids(&self) -> Vec<PartitionId>;

    /// Read a raw stored value
    fn get(&self, partition: PartitionId, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Write a raw stored value
    fn put(&self, partition: PartitionId, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Remove a value; missing keys are ignored
    fn delete(&self, partition: PartitionId, key: &[u8]) -> StorageResult<()>;

    /// Release the engine; later calls fail with `StorageError::Closed`
    fn close(&self) -> StorageResult<()>;

    /// Close the engine and remove its persisted data
    fn destroy(&self) -> StorageResult<()> {
        self.close()
    }
}
