//! Tidepool Client - embedded reads of versioned stores
//!
//! The client keeps a local replica of the cluster's store metadata, serves
//! reads of subscribed partitions from local storage, and swaps in new
//! store versions as they become current without disturbing lookups that
//! are already running against the previous one.
//!
//! # Example
//! ```ignore
//! use tidepool_client::StoreClient;
//!
//! let client = StoreClient::with_local_ingestion(config, coordinator, schemas)?;
//! client.start()?;
//! client.subscribe_all("member-profiles").await?;
//! let profile = client.get("member-profiles", b"member-42")?;
//! client.close()?;
//! ```

pub mod client;
pub mod ingestion;
pub mod lifecycle;
pub mod subscription;
pub mod version_ref;

// Re-exports
pub use client::StoreClient;
pub use ingestion::{
    BackendCommand, IngestionController, IngestionService, LocalIngestion, StoreBackend,
    VersionBackend,
};
pub use lifecycle::{Service, ServiceSet};
pub use subscription::SubscriptionSet;
pub use version_ref::{Teardown, VersionHandle, VersionRef};
