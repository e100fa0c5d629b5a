//! Sled-based persistence gateway
//!
//! Durable gateway on the Sled embedded database. Events and rollups live
//! in separate trees under time-ordered keys, so range queries and retention
//! sweeps are prefix/range scans. Values are JSON.
//!
//! Key layout:
//!
//! ```text
//! events:  [timestamp millis, sign-flipped BE (8)][event id (16)]
//! rollups: [resolution tag (1)][window start millis, sign-flipped BE (8)]
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::{Db, Tree};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace};
use usage_analytics_types::{Resolution, TimeRange, UsageEvent};

use super::gateway::{PersistenceGateway, RetentionTarget};
use crate::aggregation::WindowMetrics;
use crate::error::{StorageError, StorageResult};

const BACKEND: &str = "sled";
const EVENTS_TREE: &str = "events";
const ROLLUPS_TREE: &str = "rollups";

/// Configuration for the Sled gateway
#[derive(Debug, Clone)]
pub struct SledGatewayConfig {
    /// Path to the database directory
    pub path: PathBuf,
    /// Cache size in bytes (default: 64MB)
    pub cache_capacity: u64,
    /// Flush to disk after every write batch
    pub flush_on_write: bool,
}

impl SledGatewayConfig {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache_capacity: 64 * 1024 * 1024,
            flush_on_write: true,
        }
    }

    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_flush_on_write(mut self, flush: bool) -> Self {
        self.flush_on_write = flush;
        self
    }
}

/// Durable gateway backed by Sled
///
/// ```rust,no_run
/// use processor::storage::{SledGateway, SledGatewayConfig, PersistenceGateway};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let gateway = SledGateway::open(SledGatewayConfig::new("/var/lib/usage-analytics")).await?;
///     gateway.insert_events(&[]).await?;
///     Ok(())
/// }
/// ```
pub struct SledGateway {
    db: Arc<Db>,
    events: Tree,
    rollups: Tree,
    config: SledGatewayConfig,
}

impl SledGateway {
    /// Open (or create) the database at the configured path
    pub async fn open(config: SledGatewayConfig) -> StorageResult<Self> {
        info!("Opening Sled gateway at {:?}", config.path);

        if let Some(parent) = config.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::backend(BACKEND, format!("Failed to create directory: {}", e))
            })?;
        }

        let sled_config = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity);
        let db = tokio::task::spawn_blocking(move || sled_config.open())
            .await
            .map_err(|e| StorageError::backend(BACKEND, format!("Open task failed: {}", e)))?
            .map_err(|e| StorageError::backend(BACKEND, format!("Failed to open database: {}", e)))?;

        Self::from_db(db, config)
    }

    /// Open a throwaway database removed on drop
    pub fn temporary() -> StorageResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StorageError::backend(BACKEND, format!("Failed to open database: {}", e)))?;
        let config = SledGatewayConfig::new(std::env::temp_dir()).with_flush_on_write(false);
        Self::from_db(db, config)
    }

    fn from_db(db: Db, config: SledGatewayConfig) -> StorageResult<Self> {
        let events = db
            .open_tree(EVENTS_TREE)
            .map_err(|e| StorageError::backend(BACKEND, e))?;
        let rollups = db
            .open_tree(ROLLUPS_TREE)
            .map_err(|e| StorageError::backend(BACKEND, e))?;

        info!(
            events = events.len(),
            rollups = rollups.len(),
            "Sled gateway opened"
        );

        Ok(Self {
            db: Arc::new(db),
            events,
            rollups,
            config,
        })
    }

    /// Number of stored events
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Number of stored rollups
    pub fn rollup_count(&self) -> usize {
        self.rollups.len()
    }

    /// Flush all pending writes to disk
    pub async fn flush(&self) -> StorageResult<usize> {
        let db = Arc::clone(&self.db);
        let flushed = run_blocking(move || db.flush().map_err(|e| StorageError::backend(BACKEND, e)))
            .await?;
        debug!("Flushed {} bytes to disk", flushed);
        Ok(flushed)
    }

    async fn maybe_flush(&self) -> StorageResult<()> {
        if self.config.flush_on_write {
            self.flush().await?;
        }
        Ok(())
    }
}

async fn run_blocking<T, F>(f: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::backend(BACKEND, format!("Blocking task failed: {}", e)))?
}

/// Order-preserving encoding of signed millis
fn time_key(millis: i64) -> [u8; 8] {
    ((millis as u64) ^ (1 << 63)).to_be_bytes()
}

fn resolution_tag(resolution: Resolution) -> u8 {
    match resolution {
        Resolution::OneMinute => 1,
        Resolution::FiveMinutes => 2,
        Resolution::OneHour => 3,
        Resolution::OneDay => 4,
    }
}

fn event_key(event: &UsageEvent) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&time_key(event.timestamp.timestamp_millis()));
    key.extend_from_slice(event.id.as_bytes());
    key
}

fn rollup_key(resolution: Resolution, start_millis: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(resolution_tag(resolution));
    key.extend_from_slice(&time_key(start_millis));
    key
}

fn encode<T: serde::Serialize>(key: &[u8], value: &T) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StorageError::Serialization {
        key: format!("{:02x?}", key),
        reason: e.to_string(),
    })
}

fn decode<T: serde::de::DeserializeOwned>(key: &[u8], bytes: &[u8]) -> StorageResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization {
        key: format!("{:02x?}", key),
        reason: e.to_string(),
    })
}

#[async_trait]
impl PersistenceGateway for SledGateway {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn insert_events(&self, batch: &[UsageEvent]) -> StorageResult<()> {
        let mut writes = sled::Batch::default();
        for event in batch {
            let key = event_key(event);
            let value = encode(&key, event)?;
            writes.insert(key, value);
        }

        let tree = self.events.clone();
        run_blocking(move || {
            tree.apply_batch(writes)
                .map_err(|e| StorageError::backend(BACKEND, e))
        })
        .await?;
        trace!(count = batch.len(), "Stored event batch");
        self.maybe_flush().await
    }

    async fn insert_rollups(&self, batch: &[WindowMetrics]) -> StorageResult<()> {
        let mut writes = sled::Batch::default();
        for rollup in batch {
            let key = rollup_key(rollup.resolution, rollup.start.timestamp_millis());
            let value = encode(&key, rollup)?;
            writes.insert(key, value);
        }

        let tree = self.rollups.clone();
        run_blocking(move || {
            tree.apply_batch(writes)
                .map_err(|e| StorageError::backend(BACKEND, e))
        })
        .await?;
        trace!(count = batch.len(), "Stored rollup batch");
        self.maybe_flush().await
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        target: RetentionTarget,
    ) -> StorageResult<usize> {
        let cutoff_ms = cutoff.timestamp_millis();
        let (tree, ranges): (Tree, Vec<(Vec<u8>, Vec<u8>)>) = match target {
            RetentionTarget::RawEvents => (
                self.events.clone(),
                vec![(time_key(i64::MIN).to_vec(), time_key(cutoff_ms).to_vec())],
            ),
            RetentionTarget::Rollups => (
                self.rollups.clone(),
                Resolution::ALL
                    .iter()
                    .map(|&r| (rollup_key(r, i64::MIN), rollup_key(r, cutoff_ms)))
                    .collect(),
            ),
        };

        let removed = run_blocking(move || {
            let mut writes = sled::Batch::default();
            let mut removed = 0usize;
            for (start, end) in ranges {
                for item in tree.range(start..end) {
                    let (key, _) = item.map_err(|e| StorageError::backend(BACKEND, e))?;
                    writes.remove(key);
                    removed += 1;
                }
            }
            tree.apply_batch(writes)
                .map_err(|e| StorageError::backend(BACKEND, e))?;
            Ok(removed)
        })
        .await?;

        debug!(%target, removed, "Retention sweep");
        self.maybe_flush().await?;
        Ok(removed)
    }

    async fn query_events(&self, range: TimeRange) -> StorageResult<Vec<UsageEvent>> {
        let tree = self.events.clone();
        let start = time_key(range.start.timestamp_millis());
        let end = time_key(range.end.timestamp_millis());

        run_blocking(move || {
            tree.range(start..end)
                .map(|item| {
                    let (key, value) = item.map_err(|e| StorageError::backend(BACKEND, e))?;
                    decode(&key, &value)
                })
                .collect()
        })
        .await
    }

    async fn query_rollups(
        &self,
        resolution: Resolution,
        range: TimeRange,
    ) -> StorageResult<Vec<WindowMetrics>> {
        let tree = self.rollups.clone();
        let start = rollup_key(resolution, range.start.timestamp_millis());
        let end = rollup_key(resolution, range.end.timestamp_millis());

        run_blocking(move || {
            tree.range(start..end)
                .map(|item| {
                    let (key, value) = item.map_err(|e| StorageError::backend(BACKEND, e))?;
                    decode(&key, &value)
                })
                .collect()
        })
        .await
    }
}
