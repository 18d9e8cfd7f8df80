//! Tidepool Metadata - local replica of cluster store metadata
//!
//! The cache mirrors the store records kept by the coordination service
//! under `/{cluster}/Stores`. A child watch on that root reports stores
//! being created and deleted, and one data watch per store reports content
//! changes. Readers are always served from the local copy.
//!
//! ```text
//! coordination service ──ChangeEvent──▶ dispatcher ──▶ MetadataCache (RwLock)
//!                                                          │
//!                                                          ▼
//!                                                 StoreChangeListener(s)
//! ```

pub mod cache;
pub mod coordinator;
pub mod memory;
pub mod paths;
pub mod serializer;

// Re-exports
pub use cache::{MetadataCache, StoreChangeListener};
pub use coordinator::{ChangeEvent, ChangeKind, Coordinator, WatchId, WatchSink};
pub use memory::InMemoryCoordinator;
pub use paths::StorePaths;
pub use tidepool_common::config::WatchMode;
