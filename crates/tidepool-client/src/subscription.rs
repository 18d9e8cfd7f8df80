//! Partitions a client serves reads for

use dashmap::DashSet;
use tidepool_common::PartitionId;

/// Concurrent set of subscribed partitions of one store
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    partitions: DashSet<PartitionId>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add partitions, returning those that were not yet subscribed
    pub fn subscribe(&self, partitions: impl IntoIterator<Item = PartitionId>) -> Vec<PartitionId> {
        partitions
            .into_iter()
            .filter(|p| self.partitions.insert(*p))
            .collect()
    }

    /// Remove partitions, returning those that were subscribed
    pub fn unsubscribe(
        &self,
        partitions: impl IntoIterator<Item = PartitionId>,
    ) -> Vec<PartitionId> {
        partitions
            .into_iter()
            .filter(|p| self.partitions.remove(p).is_some())
            .collect()
    }

    pub fn contains(&self, partition: PartitionId) -> bool {
        self.partitions.contains(&partition)
    }

    /// Subscribed partitions in ascending order
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<_> = self.partitions.iter().map(|p| *p).collect();
        partitions.sort_unstable();
        partitions
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn clear(&self) {
        self.partitions.clear();
    }
}
