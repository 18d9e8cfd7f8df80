//! Tidepool Partition - key routing
//!
//! A partitioner maps the byte encoding of a key to a partition index of a
//! specific version. Routing is a pure function of the key bytes, the
//! partition count, and the hash strategy, so the same key can land on a
//! different partition under a version with a different partition count.
//!
//! # Example
//! ```ignore
//! use tidepool_partition::PartitionerFactory;
//!
//! let router = PartitionerFactory::create(&version.partitioner_config)?;
//! let partition = router.route(b"member-42", version.partition_count)?;
//! ```

pub mod partitioner;

pub use partitioner::{Md5Partitioner, PartitionRouter, PartitionerFactory, Xxh64Partitioner};
