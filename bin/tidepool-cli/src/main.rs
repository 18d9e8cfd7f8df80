//! Tidepool CLI - Admin Command Line Interface
//!
//! Inspects a metadata snapshot and queries version data kept in a local
//! redb data directory.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tidepool_client::StoreClient;
use tidepool_codec::{InMemorySchemaRepository, RecordSchema};
use tidepool_common::config::StorageBackend;
use tidepool_common::{Config, StoreRecord};
use tidepool_meta::serializer::encode_store;
use tidepool_meta::{InMemoryCoordinator, MetadataCache, StorePaths, WatchMode};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tidepool-cli")]
#[command(about = "Tidepool Admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "tidepool.toml")]
    config: PathBuf,

    /// Metadata snapshot (JSON with `stores` and `schemas`)
    #[arg(short, long)]
    snapshot: PathBuf,

    /// Data directory overriding `storage.data_dir`
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level overriding `logging.level`
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List all stores
    ListStores,
    /// Show a store record and its value schemas
    DescribeStore {
        /// Store name
        name: String,
    },
    /// Look up a key in the current version of a store
    Query {
        /// Store name
        store: String,
        /// Key, as UTF-8 text unless --hex is given
        key: String,
        /// Interpret the key as hex-encoded bytes
        #[arg(long)]
        hex: bool,
    },
}

/// A value schema entry of a snapshot
#[derive(Debug, Deserialize)]
struct SnapshotSchema {
    id: i32,
    schema: RecordSchema,
}

/// Store metadata exported from a cluster
#[derive(Debug, Default, Deserialize)]
struct Snapshot {
    #[serde(default)]
    stores: Vec<StoreRecord>,
    #[serde(default)]
    schemas: BTreeMap<String, Vec<SnapshotSchema>>,
}

impl Snapshot {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse snapshot {}", path.display()))
    }

    /// Publish the store records under the cluster's metadata root
    fn coordinator(&self, cluster: &str) -> Result<Arc<InMemoryCoordinator>> {
        let coordinator = Arc::new(InMemoryCoordinator::new(WatchMode::Persistent));
        let paths = StorePaths::new(cluster);
        for store in &self.stores {
            StorePaths::validate_store_name(&store.name)?;
            coordinator.put(&paths.store_path(&store.name), encode_store(store)?)?;
        }
        Ok(coordinator)
    }

    fn schema_repository(&self) -> Result<Arc<InMemorySchemaRepository>> {
        let repository = Arc::new(InMemorySchemaRepository::new());
        for (store, schemas) in &self.schemas {
            for entry in schemas {
                repository.register(store, entry.id, entry.schema.clone())?;
            }
        }
        Ok(repository)
    }
}

fn parse_key(key: &str, is_hex: bool) -> Result<Vec<u8>> {
    if is_hex {
        hex::decode(key).map_err(|e| anyhow::anyhow!("Invalid hex key '{key}': {e}"))
    } else {
        Ok(key.as_bytes().to_vec())
    }
}

fn list_stores(cache: &MetadataCache) {
    println!("Stores");
    println!("======");
    let stores = cache.list();
    if stores.is_empty() {
        println!("No stores found");
        return;
    }
    println!(
        "{:<32} {:<20} {:<8} {:<10} {:<6}",
        "NAME", "OWNER", "CURRENT", "VERSIONS", "READS"
    );
    println!("{}", "-".repeat(80));
    for store in stores {
        println!(
            "{:<32} {:<20} {:<8} {:<10} {:<6}",
            store.name,
            if store.owner.is_empty() {
                "-"
            } else {
                &store.owner
            },
            store
                .current_version
                .map_or_else(|| "-".to_string(), |v| v.to_string()),
            store.versions.len(),
            if store.enable_reads { "yes" } else { "no" }
        );
    }
}

fn describe_store(cache: &MetadataCache, snapshot: &Snapshot, name: &str) -> Result<()> {
    let Some(store) = cache.get(name) else {
        bail!("Store not found: {name}");
    };
    println!("Store: {}", store.name);
    println!("  Owner: {}", store.owner);
    println!("  Reads enabled: {}", store.enable_reads);
    println!("  Writes enabled: {}", store.enable_writes);
    println!("  Partitioner: {:?}", store.partitioner_config.kind);
    match store.current() {
        Some(current) => println!("  Current version: {}", current.number),
        None => println!("  Current version: -"),
    }
    println!();
    println!(
        "{:<8} {:<12} {:<12} {:<10} {:<24}",
        "VERSION", "PARTITIONS", "COMPRESSION", "CHUNKING", "LOCATION"
    );
    println!("{}", "-".repeat(70));
    for version in &store.versions {
        println!(
            "{:<8} {:<12} {:<12} {:<10} {:<24}",
            version.number,
            version.partition_count,
            format!("{:?}", version.compression_strategy),
            version.chunking_enabled,
            version.data_location()
        );
    }

    let schema_ids: Vec<_> = snapshot
        .schemas
        .get(name)
        .map(|schemas| schemas.iter().map(|s| s.id).collect())
        .unwrap_or_default();
    println!();
    println!("Value schemas: {schema_ids:?}");
    Ok(())
}

async fn query(
    config: Config,
    snapshot: &Snapshot,
    store: &str,
    key: &[u8],
) -> Result<Option<serde_json::Value>> {
    let coordinator = snapshot.coordinator(&config.cluster.name)?;
    let schemas = snapshot.schema_repository()?;
    let client = StoreClient::with_local_ingestion(config, coordinator, schemas)?;
    client.start()?;

    let result = match client.subscribe_all(store).await {
        Ok(()) => client.get(store, key),
        Err(e) => Err(e),
    };
    client.close()?;
    Ok(result?)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let snapshot = Snapshot::load(&args.snapshot)?;
    info!(
        "Loaded snapshot with {} stores from {}",
        snapshot.stores.len(),
        args.snapshot.display()
    );

    match args.command {
        Commands::ListStores => {
            let coordinator = snapshot.coordinator(&config.cluster.name)?;
            let cache = MetadataCache::new(coordinator, &config.cluster.name);
            cache.refresh()?;
            list_stores(&cache);
        }
        Commands::DescribeStore { name } => {
            let coordinator = snapshot.coordinator(&config.cluster.name)?;
            let cache = MetadataCache::new(coordinator, &config.cluster.name);
            cache.refresh()?;
            describe_store(&cache, &snapshot, &name)?;
        }
        Commands::Query { store, key, hex } => {
            let key = parse_key(&key, hex)?;
            // Queries only ever read what ingestion left on disk
            config.storage.backend = StorageBackend::Redb;
            config.storage.delete_retired_data = false;
            config.metadata.watch_mode = WatchMode::Persistent;
            if let Some(data_dir) = args.data_dir {
                config.storage.data_dir = data_dir;
            }

            match query(config, &snapshot, &store, &key).await? {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => println!("Key not found"),
            }
        }
    }

    Ok(())
}
