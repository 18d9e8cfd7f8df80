//! Partitioner strategies
//!
//! Both strategies are stateless and safe to share across threads.

use std::sync::Arc;
use tidepool_common::{Error, PartitionId, PartitionerConfig, PartitionerKind, Result};

/// Routes key bytes to a partition index
pub trait PartitionRouter: Send + Sync {
    /// Strategy name for logging
    fn name(&self) -> &'static str;

    /// Map `key` to a partition in `0..partition_count`
    ///
    /// Fails only when `partition_count` cannot be partitioned into.
    fn route(&self, key: &[u8], partition_count: u32) -> Result<PartitionId>;
}

fn check_partition_count(partition_count: u32) -> Result<i32> {
    match i32::try_from(partition_count) {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(Error::invalid_argument(format!(
            "invalid partition count: {partition_count}"
        ))),
    }
}

/// MD5-based partitioner
///
/// Takes the first four digest bytes as a signed big-endian integer and
/// uses the absolute value of its truncated remainder, which keeps keys on
/// the same partitions as other clients of the same cluster.
#[derive(Clone, Copy, Debug, Default)]
pub struct Md5Partitioner;

impl PartitionRouter for Md5Partitioner {
    fn name(&self) -> &'static str {
        "md5"
    }

    fn route(&self, key: &[u8], partition_count: u32) -> Result<PartitionId> {
        let count = check_partition_count(partition_count)?;
        let digest = md5::compute(key);
        let head = i32::from_be_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]]);
        Ok((head % count).unsigned_abs())
    }
}

/// xxHash64-based partitioner
#[derive(Clone, Copy, Debug, Default)]
pub struct Xxh64Partitioner {
    seed: u64,
}

impl Xxh64Partitioner {
    /// Parameter holding the hash seed
    pub const SEED_PARAM: &'static str = "seed";

    /// Create a partitioner with the given seed
    #[must_use]
    pub const fn with_seed(seed: u64) -> Self {
        Self { seed }
    }
}

impl PartitionRouter for Xxh64Partitioner {
    fn name(&self) -> &'static str {
        "xxh64"
    }

    fn route(&self, key: &[u8], partition_count: u32) -> Result<PartitionId> {
        check_partition_count(partition_count)?;
        let hash = xxhash_rust::xxh64::xxh64(key, self.seed);
        // partition_count fits in i32, so the remainder fits in u32
        Ok((hash % u64::from(partition_count)) as PartitionId)
    }
}

/// Builds partitioners from version configuration
pub struct PartitionerFactory;

impl PartitionerFactory {
    /// Create the partitioner described by `config`
    pub fn create(config: &PartitionerConfig) -> Result<Arc<dyn PartitionRouter>> {
        match config.kind {
            PartitionerKind::Md5 => Ok(Arc::new(Md5Partitioner)),
            PartitionerKind::Xxh64 => {
                let seed = match config.params.get(Xxh64Partitioner::SEED_PARAM) {
                    Some(raw) => raw.parse::<u64>().map_err(|e| {
                        Error::Configuration(format!("invalid xxh64 seed {raw:?}: {e}"))
                    })?,
                    None => 0,
                };
                Ok(Arc::new(Xxh64Partitioner::with_seed(seed)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_known_routes() {
        let router = Md5Partitioner;
        assert_eq!(router.route(b"k1", 4).unwrap(), 2);
        assert_eq!(router.route(b"member-42", 4).unwrap(), 0);
        assert_eq!(router.route(b"member-42", 7).unwrap(), 5);
        assert_eq!(router.route(b"", 4).unwrap(), 3);
        assert_eq!(router.route(b"a", 4).unwrap(), 1);
    }

    #[test]
    fn test_routing_is_deterministic() {
        let routers = [
            Arc::new(Md5Partitioner) as Arc<dyn PartitionRouter>,
            Arc::new(Xxh64Partitioner::default()),
        ];
        for router in routers {
            for i in 0..200u32 {
                let key = format!("key-{i}");
                let first = router.route(key.as_bytes(), 16).unwrap();
                assert!(first < 16);
                for _ in 0..3 {
                    assert_eq!(router.route(key.as_bytes(), 16).unwrap(), first);
                }
            }
        }
    }

    #[test]
    fn test_single_partition() {
        let router = Xxh64Partitioner::with_seed(7);
        for i in 0..50u32 {
            assert_eq!(router.route(&i.to_be_bytes(), 1).unwrap(), 0);
        }
    }

    #[test]
    fn test_invalid_partition_count() {
        assert!(Md5Partitioner.route(b"k", 0).is_err());
        assert!(Xxh64Partitioner::default().route(b"k", 0).is_err());
        assert!(Md5Partitioner.route(b"k", u32::MAX).is_err());
    }

    #[test]
    fn test_md5_spreads_keys() {
        let router = Md5Partitioner;
        let mut counts = [0usize; 8];
        for i in 0..4000u32 {
            let p = router.route(format!("user:{i}").as_bytes(), 8).unwrap();
            counts[p as usize] += 1;
        }
        assert!(counts.iter().all(|&c| c > 300), "skewed: {counts:?}");
    }

    #[test]
    fn test_factory() {
        let md5 = PartitionerFactory::create(&PartitionerConfig::default()).unwrap();
        assert_eq!(md5.name(), "md5");

        let config = PartitionerConfig::new(PartitionerKind::Xxh64).with_param("seed", "42");
        let xxh = PartitionerFactory::create(&config).unwrap();
        assert_eq!(xxh.name(), "xxh64");
        assert_eq!(
            xxh.route(b"abc", 32).unwrap(),
            Xxh64Partitioner::with_seed(42).route(b"abc", 32).unwrap()
        );

        let bad = PartitionerConfig::new(PartitionerKind::Xxh64).with_param("seed", "x");
        assert!(matches!(
            PartitionerFactory::create(&bad),
            Err(Error::Configuration(_))
        ));
    }
}
