//! Tidepool Storage - local data of ingested versions
//!
//! Each version's data lives in one engine keyed by its data location.
//! An engine is a set of independent partitions, each a byte-keyed map.
//!
//! Values are stored as [`ValueRecord`]s: a big-endian schema id followed
//! by the (possibly compressed) payload. Large values may be split into
//! chunks listed by a manifest record, see [`chunking`].

pub mod chunking;
pub mod engine;
pub mod error;
pub mod memory;
pub mod record;
pub mod redb_engine;
pub mod service;

// Re-exports
pub use chunking::{CHUNK_MANIFEST_SCHEMA_ID, CHUNK_SCHEMA_ID, ChunkManifest};
pub use engine::StorageEngine;
pub use error::{StorageError, StorageResult};
pub use memory::MemoryStorageEngine;
pub use record::ValueRecord;
pub use redb_engine::RedbStorageEngine;
pub use service::StorageService;
