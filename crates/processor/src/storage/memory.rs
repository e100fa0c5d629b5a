//! In-memory persistence gateway
//!
//! Keeps events ordered by `(timestamp, id)` and rollups keyed by window, so
//! retried batches overwrite instead of duplicating. Used for tests and for
//! embedding the engine without a durable store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, trace};
use usage_analytics_types::{Resolution, TimeRange, UsageEvent};
use uuid::Uuid;

use super::gateway::{PersistenceGateway, RetentionTarget};
use crate::aggregation::WindowMetrics;
use crate::error::{StorageError, StorageResult};
use crate::window::WindowKey;

const BACKEND: &str = "memory";

/// Statistics about the in-memory gateway
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryGatewayStats {
    /// Events currently stored
    pub stored_events: usize,
    /// Rollups currently stored
    pub stored_rollups: usize,
    /// Successful `insert_events` calls
    pub event_batches: u64,
    /// Successful `insert_rollups` calls
    pub rollup_batches: u64,
    /// Rollups received across all successful calls, duplicates included
    pub rollups_inserted: u64,
    /// Writes refused through failure injection
    pub failed_writes: u64,
}

/// Concurrent in-process gateway
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    events: RwLock<BTreeMap<(i64, Uuid), UsageEvent>>,
    rollups: RwLock<BTreeMap<WindowKey, WindowMetrics>>,
    rollup_log: RwLock<Vec<WindowKey>>,
    fail_writes: AtomicUsize,
    event_batches: AtomicU64,
    rollup_batches: AtomicU64,
    failed_writes: AtomicU64,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` write calls fail with `StorageError::Unavailable`
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Number of times a rollup for `key` was received
    pub fn rollup_insert_count(&self, key: WindowKey) -> usize {
        self.rollup_log.read().iter().filter(|k| **k == key).count()
    }

    /// Copy of every stored event, oldest first
    pub fn events(&self) -> Vec<UsageEvent> {
        self.events.read().values().cloned().collect()
    }

    pub fn stats(&self) -> MemoryGatewayStats {
        MemoryGatewayStats {
            stored_events: self.events.read().len(),
            stored_rollups: self.rollups.read().len(),
            event_batches: self.event_batches.load(Ordering::Relaxed),
            rollup_batches: self.rollup_batches.load(Ordering::Relaxed),
            rollups_inserted: self.rollup_log.read().len() as u64,
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
        }
    }

    fn check_injected_failure(&self, operation: &str) -> StorageResult<()> {
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.failed_writes.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::Unavailable {
                backend_type: BACKEND.to_string(),
                details: format!("injected failure during {}", operation),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn insert_events(&self, batch: &[UsageEvent]) -> StorageResult<()> {
        self.check_injected_failure("insert_events")?;

        let mut events = self.events.write();
        for event in batch {
            events.insert((event.timestamp.timestamp_millis(), event.id), event.clone());
        }
        self.event_batches.fetch_add(1, Ordering::Relaxed);
        trace!(count = batch.len(), "Stored event batch");
        Ok(())
    }

    async fn insert_rollups(&self, batch: &[WindowMetrics]) -> StorageResult<()> {
        self.check_injected_failure("insert_rollups")?;

        let mut rollups = self.rollups.write();
        let mut log = self.rollup_log.write();
        for rollup in batch {
            rollups.insert(rollup.key(), rollup.clone());
            log.push(rollup.key());
        }
        self.rollup_batches.fetch_add(1, Ordering::Relaxed);
        trace!(count = batch.len(), "Stored rollup batch");
        Ok(())
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        target: RetentionTarget,
    ) -> StorageResult<usize> {
        let cutoff_ms = cutoff.timestamp_millis();
        let removed = match target {
            RetentionTarget::RawEvents => {
                let mut events = self.events.write();
                let before = events.len();
                events.retain(|(ts, _), _| *ts >= cutoff_ms);
                before - events.len()
            }
            RetentionTarget::Rollups => {
                let mut rollups = self.rollups.write();
                let before = rollups.len();
                rollups.retain(|_, r| r.start >= cutoff);
                before - rollups.len()
            }
        };
        debug!(%target, removed, "Retention sweep");
        Ok(removed)
    }

    async fn query_events(&self, range: TimeRange) -> StorageResult<Vec<UsageEvent>> {
        let start = (range.start.timestamp_millis(), Uuid::nil());
        let end = (range.end.timestamp_millis(), Uuid::nil());
        Ok(self
            .events
            .read()
            .range(start..end)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn query_rollups(
        &self,
        resolution: Resolution,
        range: TimeRange,
    ) -> StorageResult<Vec<WindowMetrics>> {
        let start = WindowKey::new(resolution, range.start.timestamp_millis());
        let end = WindowKey::new(resolution, range.end.timestamp_millis());
        Ok(self
            .rollups
            .read()
            .range(start..end)
            .map(|(_, r)| r.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use usage_analytics_types::{AiRequest, EventDraft};

    fn event_at(ts: DateTime<Utc>) -> UsageEvent {
        EventDraft::from(AiRequest::new("chat", "m", "p", 10.0, 1, 0.01))
            .at(ts)
            .finalize(ts)
    }

    #[tokio::test]
    async fn test_events_roundtrip_and_retention() {
        let gateway = InMemoryGateway::new();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let batch: Vec<_> = (0..10).map(|i| event_at(base + Duration::days(i))).collect();

        gateway.insert_events(&batch).await.unwrap();
        // A retried batch collapses onto the same keys
        gateway.insert_events(&batch[..3]).await.unwrap();
        assert_eq!(gateway.stats().stored_events, 10);

        let range = TimeRange::new(base + Duration::days(2), base + Duration::days(5));
        assert_eq!(gateway.query_events(range).await.unwrap().len(), 3);

        let removed = gateway
            .delete_older_than(base + Duration::days(7), RetentionTarget::RawEvents)
            .await
            .unwrap();
        assert_eq!(removed, 7);
        assert_eq!(gateway.events().len(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let gateway = InMemoryGateway::new();
        let now = Utc::now();
        gateway.fail_next_writes(2);

        assert!(gateway.insert_events(&[event_at(now)]).await.is_err());
        assert!(gateway.insert_rollups(&[]).await.is_err());
        assert!(gateway.insert_events(&[event_at(now)]).await.is_ok());

        let stats = gateway.stats();
        assert_eq!(stats.failed_writes, 2);
        assert_eq!(stats.event_batches, 1);
    }
}
