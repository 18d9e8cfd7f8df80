//! Configuration types for Tidepool
//!
//! Every section has defaults so a client can run with an empty file.
//! `Config::load` layers a TOML file and `TIDEPOOL__`-prefixed environment
//! variables on top of those defaults.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration for a Tidepool client node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cluster configuration
    pub cluster: ClusterConfig,
    /// Local storage configuration
    pub storage: StorageConfig,
    /// Metadata replication configuration
    pub metadata: MetadataConfig,
    /// Read path configuration
    pub read: ReadConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Environment variable prefix for overrides
    pub const ENV_PREFIX: &'static str = "TIDEPOOL";

    /// Load configuration from a TOML file with environment overrides
    ///
    /// `TIDEPOOL__CLUSTER__NAME=prod` overrides `cluster.name`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the client cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cluster.name.trim().is_empty() {
            return Err(Error::Configuration("cluster.name must not be empty".into()));
        }
        if self.cluster.name.contains('/') {
            return Err(Error::Configuration(format!(
                "cluster.name must not contain '/': {}",
                self.cluster.name
            )));
        }
        if self.read.deserializer_cache_capacity == 0 {
            return Err(Error::Configuration(
                "read.deserializer_cache_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Cluster configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster name, the first component of every metadata path
    pub name: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "tidepool".to_string(),
        }
    }
}

/// Storage engine backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Heap-backed engines, lost on restart
    #[default]
    Memory,
    /// One redb database file per data location
    Redb,
}

/// Local storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding version data
    pub data_dir: PathBuf,
    /// Engine backend
    pub backend: StorageBackend,
    /// Remove a retired version's data files once it is torn down
    pub delete_retired_data: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./tidepool-data"),
            backend: StorageBackend::Memory,
            delete_retired_data: false,
        }
    }
}

/// How the coordination backend delivers watch notifications
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// A watch keeps firing until it is cancelled
    #[default]
    Persistent,
    /// A watch fires once and must be re-armed
    OneShot,
}

/// Metadata replication configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Watch contract of the coordination backend
    pub watch_mode: WatchMode,
}

/// Read path configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    /// Maximum number of cached (writer, reader) deserializers
    pub deserializer_cache_capacity: usize,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            deserializer_cache_capacity: 256,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cluster.name, "tidepool");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.metadata.watch_mode, WatchMode::Persistent);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[cluster]
name = "prod-west"

[storage]
backend = "redb"
data_dir = "/tmp/tp"

[metadata]
watch_mode = "one_shot"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.cluster.name, "prod-west");
        assert_eq!(config.storage.backend, StorageBackend::Redb);
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/tp"));
        assert_eq!(config.metadata.watch_mode, WatchMode::OneShot);
        assert_eq!(config.read.deserializer_cache_capacity, 256);
    }

    #[test]
    fn test_validate_rejects_bad_cluster() {
        let mut config = Config::default();
        config.cluster.name = "a/b".into();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.cluster.name = " ".into();
        assert!(config.validate().is_err());
    }
}
