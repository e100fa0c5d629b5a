//! Multi-resolution aggregator
//!
//! One map per resolution from bucket key to window. Every window sits
//! behind its own mutex, so updates to one window are applied in arrival
//! order while different windows and resolutions proceed in parallel.
//!
//! ## Lifecycle
//!
//! A sweep first raises the resolution's watermark to `now`, then closes
//! every window whose end is at or before it, hands the snapshots to the
//! gateway in one `insert_rollups` call and, only on success, marks them
//! flushed and evicts them. Windows whose insert failed stay closed and are
//! retried by the next sweep. Sweeps are serialized, and a bucket below the
//! watermark is never recreated, so each window is persisted exactly once.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};
use usage_analytics_config::AggregationConfig;
use usage_analytics_types::{Resolution, UsageEvent};

use crate::aggregation::{AggregationWindow, WindowMetrics};
use crate::error::{Result, WindowError, WindowResult};
use crate::storage::PersistenceGateway;
use crate::window::{BucketAssigner, WindowBounds, WindowKey, WindowState};

type WindowCell = Arc<Mutex<AggregationWindow>>;

struct ResolutionWindows {
    windows: DashMap<i64, WindowCell>,
    /// Buckets ending at or before this millis timestamp are closed for good
    watermark: AtomicI64,
}

impl ResolutionWindows {
    fn new() -> Self {
        Self {
            windows: DashMap::new(),
            watermark: AtomicI64::new(i64::MIN),
        }
    }
}

/// Result of feeding one event to every resolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Windows the event was folded into
    pub applied: usize,
    /// Resolutions whose window had already closed
    pub late: usize,
}

/// Windows persisted by one sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub flushed: Vec<WindowMetrics>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.flushed.is_empty()
    }
}

/// Aggregator statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatorStats {
    /// Live windows per resolution
    pub open_windows: BTreeMap<Resolution, usize>,
    /// Window updates applied
    pub updates_applied: u64,
    /// Window updates rejected because the bucket had closed
    pub late_updates: u64,
    /// Rollups successfully handed to the gateway
    pub rollups_flushed: u64,
    /// Failed rollup inserts
    pub flush_failures: u64,
}

/// Live windowed accumulators at several resolutions
pub struct MultiResolutionAggregator {
    assigner: BucketAssigner,
    top_n: usize,
    levels: HashMap<Resolution, ResolutionWindows>,
    sweep_lock: tokio::sync::Mutex<()>,
    updates_applied: AtomicU64,
    late_updates: AtomicU64,
    rollups_flushed: AtomicU64,
    flush_failures: AtomicU64,
}

impl MultiResolutionAggregator {
    pub fn new(resolutions: impl IntoIterator<Item = Resolution>, top_n: usize) -> Self {
        let assigner = BucketAssigner::new(resolutions);
        let levels = assigner
            .resolutions()
            .iter()
            .map(|&r| (r, ResolutionWindows::new()))
            .collect();

        Self {
            assigner,
            top_n: top_n.clamp(1, usage_analytics_config::MAX_TOP_N),
            levels,
            sweep_lock: tokio::sync::Mutex::new(()),
            updates_applied: AtomicU64::new(0),
            late_updates: AtomicU64::new(0),
            rollups_flushed: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &AggregationConfig) -> Self {
        Self::new(config.resolutions.iter().copied(), config.top_n)
    }

    pub fn resolutions(&self) -> &[Resolution] {
        self.assigner.resolutions()
    }

    pub fn tracks(&self, resolution: Resolution) -> bool {
        self.levels.contains_key(&resolution)
    }

    /// Fold an event into its bucket at every resolution
    pub fn update(&self, event: &UsageEvent) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::default();

        for (key, bounds) in self.assigner.assign(event.timestamp) {
            let Some(level) = self.levels.get(&key.resolution) else {
                continue;
            };
            match self.apply(level, key, bounds, event) {
                Ok(()) => outcome.applied += 1,
                Err(e) => {
                    trace!(event_id = %event.id, error = %e, "Late event for window");
                    outcome.late += 1;
                }
            }
        }

        self.updates_applied
            .fetch_add(outcome.applied as u64, Ordering::Relaxed);
        if outcome.late > 0 {
            self.late_updates
                .fetch_add(outcome.late as u64, Ordering::Relaxed);
            debug!(
                event_id = %event.id,
                timestamp = %event.timestamp,
                late = outcome.late,
                "Event arrived after its windows closed"
            );
        }
        outcome
    }

    fn apply(
        &self,
        level: &ResolutionWindows,
        key: WindowKey,
        bounds: WindowBounds,
        event: &UsageEvent,
    ) -> WindowResult<()> {
        // The shard lock is released before the window lock is taken
        let cell = match level.windows.entry(key.bucket) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let watermark = level.watermark.load(Ordering::SeqCst);
                if bounds.end.timestamp_millis() <= watermark {
                    return Err(WindowError::LateEvent {
                        bucket_start: key.bucket,
                        watermark,
                    });
                }
                trace!(window = %key, "Opening window");
                let window = AggregationWindow::new(key, bounds, self.top_n);
                Arc::clone(entry.insert(Arc::new(Mutex::new(window))).value())
            }
        };

        let mut window = cell.lock();
        window.apply(event)
    }

    /// Torn-free copy of the window containing `now`
    ///
    /// Returns an empty window when no event has touched the bucket yet, and
    /// `None` when the resolution is not tracked.
    pub fn realtime(&self, resolution: Resolution, now: DateTime<Utc>) -> Option<WindowMetrics> {
        let level = self.levels.get(&resolution)?;
        let cell = level
            .windows
            .get(&resolution.bucket_key(now))
            .map(|entry| Arc::clone(entry.value()));

        let metrics = match cell {
            Some(cell) => cell.lock().snapshot(),
            None => WindowMetrics::empty(resolution, BucketAssigner::bounds(resolution, now)),
        };
        Some(metrics)
    }

    /// Copies of every live window at `resolution`, oldest first
    pub fn live_windows(&self, resolution: Resolution) -> Vec<WindowMetrics> {
        let Some(level) = self.levels.get(&resolution) else {
            return Vec::new();
        };
        let cells: Vec<WindowCell> = level
            .windows
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut windows: Vec<WindowMetrics> = cells.iter().map(|c| c.lock().snapshot()).collect();
        windows.sort_by_key(|w| w.start);
        windows
    }

    /// Close and persist every window whose end is at or before `now`
    pub async fn flush_completed(
        &self,
        now: DateTime<Utc>,
        gateway: &dyn PersistenceGateway,
    ) -> Result<SweepReport> {
        let _guard = self.sweep_lock.lock().await;
        let now_ms = now.timestamp_millis();

        let mut due = Vec::new();
        for (&resolution, level) in &self.levels {
            level.watermark.fetch_max(now_ms, Ordering::SeqCst);
            for entry in level.windows.iter() {
                if entry.key() + resolution.as_millis() <= now_ms {
                    due.push((resolution, *entry.key(), Arc::clone(entry.value())));
                }
            }
        }

        self.flush_windows(due, gateway).await
    }

    /// Close and persist every live window regardless of its end time
    ///
    /// Used on shutdown; afterwards no bucket accepts events.
    pub async fn flush_all(&self, gateway: &dyn PersistenceGateway) -> Result<SweepReport> {
        let _guard = self.sweep_lock.lock().await;

        let mut due = Vec::new();
        for (&resolution, level) in &self.levels {
            level.watermark.store(i64::MAX, Ordering::SeqCst);
            for entry in level.windows.iter() {
                due.push((resolution, *entry.key(), Arc::clone(entry.value())));
            }
        }

        let report = self.flush_windows(due, gateway).await?;
        info!(windows = report.flushed.len(), "Flushed all live windows");
        Ok(report)
    }

    async fn flush_windows(
        &self,
        due: Vec<(Resolution, i64, WindowCell)>,
        gateway: &dyn PersistenceGateway,
    ) -> Result<SweepReport> {
        if due.is_empty() {
            return Ok(SweepReport::default());
        }

        let mut batch: Vec<WindowMetrics> = due
            .iter()
            .map(|(_, _, cell)| {
                let mut window = cell.lock();
                if window.close() {
                    trace!(window = %window.key(), "Closed window");
                }
                window.snapshot()
            })
            .collect();
        batch.sort_by_key(|w| (w.resolution, w.start));

        if let Err(e) = gateway.insert_rollups(&batch).await {
            self.flush_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                backend = gateway.backend_name(),
                windows = batch.len(),
                error = %e,
                "Rollup flush failed; windows stay closed for the next sweep"
            );
            return Err(e.into());
        }

        for (resolution, bucket, cell) in due {
            {
                let mut window = cell.lock();
                window.transition(WindowState::Flushed)?;
                window.transition(WindowState::Evicted)?;
            }
            if let Some(level) = self.levels.get(&resolution) {
                level.windows.remove(&bucket);
            }
        }

        self.rollups_flushed
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        debug!(
            backend = gateway.backend_name(),
            windows = batch.len(),
            "Flushed completed windows"
        );
        Ok(SweepReport { flushed: batch })
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            open_windows: self
                .levels
                .iter()
                .map(|(&r, level)| (r, level.windows.len()))
                .collect(),
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            late_updates: self.late_updates.load(Ordering::Relaxed),
            rollups_flushed: self.rollups_flushed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MultiResolutionAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiResolutionAggregator")
            .field("resolutions", &self.assigner.resolutions())
            .field("top_n", &self.top_n)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryGateway;
    use chrono::{Duration, TimeZone};
    use usage_analytics_types::{AiRequest, EventDraft};

    fn event(ts: DateTime<Utc>, latency: f64, cost: f64) -> UsageEvent {
        EventDraft::from(AiRequest::new("chat", "gpt-4o", "openai", latency, 10, cost))
            .at(ts)
            .finalize(ts)
    }

    #[test]
    fn test_update_touches_every_resolution() {
        let agg = MultiResolutionAggregator::new(Resolution::ALL, 10);
        let ts = Utc.with_ymd_and_hms(2024, 2, 1, 8, 30, 15).unwrap();

        let outcome = agg.update(&event(ts, 100.0, 0.01));
        assert_eq!(outcome, UpdateOutcome { applied: 4, late: 0 });

        let stats = agg.stats();
        assert!(stats.open_windows.values().all(|&n| n == 1));
        assert_eq!(stats.updates_applied, 4);
    }

    #[test]
    fn test_realtime_for_untouched_bucket_is_empty() {
        let agg = MultiResolutionAggregator::new([Resolution::OneMinute], 10);
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 8, 30, 15).unwrap();

        let metrics = agg.realtime(Resolution::OneMinute, now).unwrap();
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.start, Utc.with_ymd_and_hms(2024, 2, 1, 8, 30, 0).unwrap());
        assert!(agg.realtime(Resolution::OneDay, now).is_none());
    }

    #[tokio::test]
    async fn test_sweep_flushes_only_completed_windows() {
        let agg = MultiResolutionAggregator::new([Resolution::OneMinute, Resolution::OneHour], 10);
        let gateway = InMemoryGateway::new();
        let base = Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap();

        agg.update(&event(base + Duration::seconds(10), 100.0, 0.01));
        agg.update(&event(base + Duration::seconds(70), 100.0, 0.01));

        let report = agg
            .flush_completed(base + Duration::seconds(90), &gateway)
            .await
            .unwrap();

        assert_eq!(report.flushed.len(), 1);
        assert_eq!(report.flushed[0].start, base);
        assert_eq!(report.flushed[0].state, WindowState::Closed);

        let stats = agg.stats();
        assert_eq!(stats.open_windows[&Resolution::OneMinute], 1);
        assert_eq!(stats.open_windows[&Resolution::OneHour], 1);
        assert_eq!(stats.rollups_flushed, 1);
    }

    #[tokio::test]
    async fn test_events_for_swept_bucket_are_late() {
        let agg = MultiResolutionAggregator::new([Resolution::OneMinute], 10);
        let gateway = InMemoryGateway::new();
        let base = Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap();

        agg.update(&event(base, 100.0, 0.01));
        agg.flush_completed(base + Duration::minutes(1), &gateway)
            .await
            .unwrap();

        let outcome = agg.update(&event(base + Duration::seconds(30), 100.0, 0.01));
        assert_eq!(outcome, UpdateOutcome { applied: 0, late: 1 });
        assert_eq!(agg.stats().open_windows[&Resolution::OneMinute], 0);
        assert_eq!(agg.stats().late_updates, 1);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_windows_closed_for_retry() {
        let agg = MultiResolutionAggregator::new([Resolution::OneMinute], 10);
        let gateway = InMemoryGateway::new();
        let base = Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap();

        agg.update(&event(base, 100.0, 0.01));
        gateway.fail_next_writes(1);

        let first = agg
            .flush_completed(base + Duration::minutes(1), &gateway)
            .await;
        assert!(first.is_err());

        // Closed, so this event cannot slip into the pending rollup
        let outcome = agg.update(&event(base + Duration::seconds(5), 100.0, 0.01));
        assert_eq!(outcome.late, 1);

        let second = agg
            .flush_completed(base + Duration::minutes(2), &gateway)
            .await
            .unwrap();
        assert_eq!(second.flushed.len(), 1);
        assert_eq!(second.flushed[0].total_requests, 1);
        assert_eq!(agg.stats().flush_failures, 1);
    }

    #[tokio::test]
    async fn test_flush_all_drains_open_windows() {
        let agg = MultiResolutionAggregator::new(Resolution::ALL, 10);
        let gateway = InMemoryGateway::new();
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 30).unwrap();

        agg.update(&event(now, 100.0, 0.01));
        let report = agg.flush_all(&gateway).await.unwrap();

        assert_eq!(report.flushed.len(), 4);
        assert_eq!(gateway.stats().stored_rollups, 4);
        assert!(agg.stats().open_windows.values().all(|&n| n == 0));
        assert_eq!(agg.update(&event(now, 1.0, 0.0)).late, 4);
    }
}
