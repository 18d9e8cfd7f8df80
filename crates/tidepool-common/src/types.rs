//! Core type definitions for Tidepool
//!
//! Store and version records are the unit of replication for the metadata
//! cache. Both are immutable once built: an update always replaces the
//! whole record so readers never see a partially applied change.

use crate::error::{Error, Result};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Partition index within a version
pub type PartitionId = u32;

/// Version number of a store
pub type VersionNumber = u32;

/// Identifier of the change-log / storage location backing one version
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct DataLocation(String);

impl DataLocation {
    /// Separator between store name and version number
    pub const VERSION_SEPARATOR: &'static str = "_v";

    /// Compose the location of `version` of `store`
    #[must_use]
    pub fn for_version(store: &str, version: VersionNumber) -> Self {
        Self(format!("{store}{}{version}", Self::VERSION_SEPARATOR))
    }

    /// Get the location as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the location back into store name and version number
    #[must_use]
    pub fn parse(&self) -> Option<(&str, VersionNumber)> {
        let (store, version) = self.0.rsplit_once(Self::VERSION_SEPARATOR)?;
        if store.is_empty() {
            return None;
        }
        version.parse().ok().map(|v| (store, v))
    }
}

impl fmt::Debug for DataLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataLocation({:?})", self.0)
    }
}

/// Compression applied to stored values of a version
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionStrategy {
    /// Values are stored as-is
    #[default]
    NoOp,
    /// Values are gzip compressed
    Gzip,
}

impl CompressionStrategy {
    /// Numeric id of the strategy
    #[must_use]
    pub const fn id(&self) -> i32 {
        match self {
            Self::NoOp => 0,
            Self::Gzip => 1,
        }
    }

    /// Look up a strategy by numeric id
    #[must_use]
    pub const fn from_id(id: i32) -> Option<Self> {
        match id {
            0 => Some(Self::NoOp),
            1 => Some(Self::Gzip),
            _ => None,
        }
    }
}

impl fmt::Display for CompressionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp => write!(f, "NO_OP"),
            Self::Gzip => write!(f, "GZIP"),
        }
    }
}

/// Hash function used to route keys to partitions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionerKind {
    /// MD5 of the key bytes, first four bytes as a signed big-endian integer
    #[default]
    Md5,
    /// xxHash64 of the key bytes
    Xxh64,
}

/// Partitioner configuration carried by stores and versions
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionerConfig {
    /// Hash function
    #[serde(default)]
    pub kind: PartitionerKind,
    /// Strategy specific parameters
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl PartitionerConfig {
    /// Create a config for the given strategy with no parameters
    #[must_use]
    pub fn new(kind: PartitionerKind) -> Self {
        Self {
            kind,
            params: BTreeMap::new(),
        }
    }

    /// Add a strategy parameter
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// One immutable generation of a store's data
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Owning store
    pub store_name: String,
    /// Version number, unique within the store
    pub number: VersionNumber,
    /// Partition count, fixed for the lifetime of the version
    pub partition_count: u32,
    /// Compression applied to values
    #[serde(default)]
    pub compression_strategy: CompressionStrategy,
    /// Whether large values are split into chunks
    #[serde(default)]
    pub chunking_enabled: bool,
    /// Key routing for this version
    #[serde(default)]
    pub partitioner_config: PartitionerConfig,
}

impl VersionRecord {
    /// Create a version with no compression and no chunking
    #[must_use]
    pub fn new(store_name: impl Into<String>, number: VersionNumber, partition_count: u32) -> Self {
        Self {
            store_name: store_name.into(),
            number,
            partition_count,
            compression_strategy: CompressionStrategy::NoOp,
            chunking_enabled: false,
            partitioner_config: PartitionerConfig::default(),
        }
    }

    /// Set the compression strategy
    #[must_use]
    pub fn with_compression(mut self, strategy: CompressionStrategy) -> Self {
        self.compression_strategy = strategy;
        self
    }

    /// Enable or disable chunking
    #[must_use]
    pub fn with_chunking(mut self, enabled: bool) -> Self {
        self.chunking_enabled = enabled;
        self
    }

    /// Set the partitioner
    #[must_use]
    pub fn with_partitioner(mut self, config: PartitionerConfig) -> Self {
        self.partitioner_config = config;
        self
    }

    /// Storage location holding this version's data
    #[must_use]
    pub fn data_location(&self) -> DataLocation {
        DataLocation::for_version(&self.store_name, self.number)
    }
}

/// A named logical dataset with its versions
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecord {
    /// Unique, immutable store name
    pub name: String,
    /// Owner of the store
    #[serde(default)]
    pub owner: String,
    /// Versions ordered by version number
    #[serde(default)]
    pub versions: Vec<VersionRecord>,
    /// Version currently serving reads
    #[serde(default)]
    pub current_version: Option<VersionNumber>,
    /// Whether reads are allowed
    #[serde(default = "default_enabled")]
    pub enable_reads: bool,
    /// Whether new versions may be pushed
    #[serde(default = "default_enabled")]
    pub enable_writes: bool,
    /// Partitioner used for new versions
    #[serde(default)]
    pub partitioner_config: PartitionerConfig,
}

fn default_enabled() -> bool {
    true
}

impl StoreRecord {
    /// Create an empty store with reads and writes enabled
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: String::new(),
            versions: Vec::new(),
            current_version: None,
            enable_reads: true,
            enable_writes: true,
            partitioner_config: PartitionerConfig::default(),
        }
    }

    /// Look up a version by number
    #[must_use]
    pub fn version(&self, number: VersionNumber) -> Option<&VersionRecord> {
        self.versions.iter().find(|v| v.number == number)
    }

    /// The version currently serving reads, if any
    #[must_use]
    pub fn current(&self) -> Option<&VersionRecord> {
        self.current_version.and_then(|n| self.version(n))
    }

    /// Highest version number, if the store has any version
    #[must_use]
    pub fn largest_version(&self) -> Option<VersionNumber> {
        self.versions.iter().map(|v| v.number).max()
    }

    /// Return a copy of this record with `version` added
    pub fn with_version(mut self, version: VersionRecord) -> Result<Self> {
        if version.store_name != self.name {
            return Err(Error::invalid_argument(format!(
                "version {} belongs to store {}, not {}",
                version.number, version.store_name, self.name
            )));
        }
        if self.version(version.number).is_some() {
            return Err(Error::invalid_argument(format!(
                "store {} already has version {}",
                self.name, version.number
            )));
        }
        self.versions.push(version);
        self.versions.sort_by_key(|v| v.number);
        Ok(self)
    }

    /// Return a copy of this record serving `number`
    pub fn with_current_version(mut self, number: VersionNumber) -> Result<Self> {
        if self.version(number).is_none() {
            return Err(Error::invalid_argument(format!(
                "store {} has no version {}",
                self.name, number
            )));
        }
        self.current_version = Some(number);
        Ok(self)
    }

    /// Return a copy of this record without `number`
    #[must_use]
    pub fn without_version(mut self, number: VersionNumber) -> Self {
        self.versions.retain(|v| v.number != number);
        if self.current_version == Some(number) {
            self.current_version = None;
        }
        self
    }

    /// Check the record invariants
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid_argument("store name is empty"));
        }
        let mut seen = HashSet::with_capacity(self.versions.len());
        for version in &self.versions {
            if !seen.insert(version.number) {
                return Err(Error::invalid_argument(format!(
                    "store {} has duplicate version {}",
                    self.name, version.number
                )));
            }
            if version.store_name != self.name {
                return Err(Error::invalid_argument(format!(
                    "version {} of store {} names store {}",
                    version.number, self.name, version.store_name
                )));
            }
            if version.partition_count == 0 {
                return Err(Error::invalid_argument(format!(
                    "version {} of store {} has no partitions",
                    version.number, self.name
                )));
            }
        }
        if let Some(current) = self.current_version
            && self.version(current).is_none()
        {
            return Err(Error::invalid_argument(format!(
                "store {} serves missing version {}",
                self.name, current
            )));
        }
        Ok(())
    }
}
