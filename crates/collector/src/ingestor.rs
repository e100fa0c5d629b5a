//! Event ingestor and background cycle
//!
//! `track` finalizes an event, buffers it and folds it into the live
//! windows. Storage writes happen only in the background cycle, which
//! flushes the buffer on a timer or as soon as a full batch is waiting,
//! sweeps completed windows and applies retention. A failed write puts the
//! batch back at the head of the buffer for the next cycle.
//!
//! Overflow alerts raised by `track` are queued and delivered by the cycle,
//! so a slow alert sink never holds up ingestion.

use chrono::Duration as ChronoDuration;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use usage_analytics_config::{IngestionConfig, RetentionConfig};
use usage_analytics_types::{EventDraft, TimeRange, UsageEvent};

use processor::{MultiResolutionAggregator, PersistenceGateway, RetentionTarget, SweepReport};

use crate::alerts::{Alert, AlertSink};
use crate::buffer::{BufferStats, EventBuffer, PushOutcome};
use crate::clock::Clock;
use crate::error::{CollectorError, Result};

/// Ingestion statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestorStats {
    /// Events accepted by `track`
    pub events_received: u64,
    /// Events written to the gateway
    pub events_persisted: u64,
    /// Successful event batch writes
    pub batches_flushed: u64,
    /// Failed event batch writes
    pub flush_failures: u64,
    /// Events that arrived after their windows had been swept
    pub late_events: u64,
    /// Events lost to buffer overflow
    pub events_dropped: u64,
    /// Events refused under `reject_new`
    pub events_rejected: u64,
    pub current_buffer_size: usize,
    pub buffer_utilization_percent: f64,
}

/// Rows removed by one retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub raw_events_removed: usize,
    pub rollups_removed: usize,
}

pub struct EventIngestor {
    buffer: EventBuffer,
    batch_size: usize,
    aggregator: Arc<MultiResolutionAggregator>,
    gateway: Arc<dyn PersistenceGateway>,
    alerts: Arc<dyn AlertSink>,
    alerts_enabled: bool,
    clock: Arc<dyn Clock>,
    flush_requested: Notify,
    flush_lock: Mutex<()>,
    alert_tx: mpsc::UnboundedSender<Alert>,
    /// Held by the running cycle for its whole lifetime
    alert_rx: Mutex<mpsc::UnboundedReceiver<Alert>>,
    events_received: AtomicU64,
    events_persisted: AtomicU64,
    batches_flushed: AtomicU64,
    flush_failures: AtomicU64,
    late_events: AtomicU64,
}

impl EventIngestor {
    pub fn new(
        config: &IngestionConfig,
        aggregator: Arc<MultiResolutionAggregator>,
        gateway: Arc<dyn PersistenceGateway>,
        alerts: Arc<dyn AlertSink>,
        alerts_enabled: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        Self {
            buffer: EventBuffer::new(config.max_buffer_size, config.overflow_strategy),
            batch_size: config.batch_size.max(1),
            aggregator,
            gateway,
            alerts,
            alerts_enabled,
            clock,
            flush_requested: Notify::new(),
            flush_lock: Mutex::new(()),
            alert_tx,
            alert_rx: Mutex::new(alert_rx),
            events_received: AtomicU64::new(0),
            events_persisted: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            late_events: AtomicU64::new(0),
        }
    }

    /// Finalize, buffer and aggregate one event
    pub async fn track(&self, draft: EventDraft) -> Result<UsageEvent> {
        draft.payload.validate()?;
        let event = draft.finalize(self.clock.now());

        let outcome = self.buffer.push(event.clone());
        if outcome.is_overflow() {
            self.report_overflow(outcome);
        }
        if outcome == PushOutcome::Rejected {
            return Err(CollectorError::BufferFull {
                capacity: self.buffer.capacity(),
            });
        }

        self.events_received.fetch_add(1, Ordering::Relaxed);
        if outcome.is_buffered() && self.aggregator.update(&event).late > 0 {
            self.late_events.fetch_add(1, Ordering::Relaxed);
        }

        if self.buffer.len() >= self.batch_size {
            self.flush_requested.notify_one();
        }
        Ok(event)
    }

    fn report_overflow(&self, outcome: PushOutcome) {
        let strategy = self.buffer.strategy().name();
        warn!(
            capacity = self.buffer.capacity(),
            strategy,
            outcome = ?outcome,
            "Ingest buffer overflow"
        );
        if self.alerts_enabled {
            let alert = Alert::buffer_overflow(strategy, self.buffer.capacity(), self.clock.now());
            if self.alert_tx.send(alert).is_err() {
                warn!("Alert queue closed; overflow alert dropped");
            }
        }
    }

    async fn deliver_alert(&self, alert: Alert) {
        let kind = alert.kind;
        if let Err(e) = self.alerts.send(alert).await {
            warn!(%kind, error = %e, "Failed to deliver alert");
        }
    }

    /// Deliver queued overflow alerts now
    ///
    /// Returns 0 without waiting while the background cycle owns the queue;
    /// the cycle delivers them itself.
    pub async fn deliver_pending_alerts(&self) -> usize {
        let Ok(mut queue) = self.alert_rx.try_lock() else {
            return 0;
        };
        let mut delivered = 0;
        while let Ok(alert) = queue.try_recv() {
            self.deliver_alert(alert).await;
            delivered += 1;
        }
        delivered
    }

    /// Write buffered events to the gateway in batches
    ///
    /// Drains at most what was buffered when the flush began. On a failed
    /// write the batch is re-queued at the head and the error returned.
    pub async fn flush(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock().await;
        let mut remaining = self.buffer.len();
        let mut written = 0;

        while remaining > 0 {
            let batch = self.buffer.take_batch(self.batch_size.min(remaining));
            if batch.is_empty() {
                break;
            }
            remaining -= batch.len();

            match self.gateway.insert_events(&batch).await {
                Ok(()) => {
                    written += batch.len();
                    self.events_persisted
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    self.batches_flushed.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        backend = self.gateway.backend_name(),
                        events = batch.len(),
                        "Flushed event batch"
                    );
                }
                Err(e) => {
                    self.flush_failures.fetch_add(1, Ordering::Relaxed);
                    let size = batch.len();
                    let lost = self.buffer.requeue(batch);
                    warn!(
                        backend = self.gateway.backend_name(),
                        events = size,
                        lost,
                        error = %e,
                        "Event batch write failed; re-queued for next cycle"
                    );
                    return Err(e.into());
                }
            }
        }
        Ok(written)
    }

    /// Close and persist windows whose end has passed
    pub async fn sweep(&self) -> Result<SweepReport> {
        let report = self
            .aggregator
            .flush_completed(self.clock.now(), self.gateway.as_ref())
            .await?;
        Ok(report)
    }

    /// Delete raw events and rollups past their retention periods
    pub async fn cleanup(&self, retention: &RetentionConfig) -> Result<RetentionReport> {
        let now = self.clock.now();
        let raw_cutoff = now - ChronoDuration::days(i64::from(retention.raw_days));
        let rollup_cutoff = now - ChronoDuration::days(i64::from(retention.aggregated_days));

        let report = RetentionReport {
            raw_events_removed: self
                .gateway
                .delete_older_than(raw_cutoff, RetentionTarget::RawEvents)
                .await?,
            rollups_removed: self
                .gateway
                .delete_older_than(rollup_cutoff, RetentionTarget::Rollups)
                .await?,
        };
        info!(
            raw_events = report.raw_events_removed,
            rollups = report.rollups_removed,
            "Retention cleanup complete"
        );
        Ok(report)
    }

    /// Buffered events not yet written, within `range`
    pub fn pending_events(&self, range: TimeRange) -> Vec<UsageEvent> {
        self.buffer.snapshot(range)
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    pub fn stats(&self) -> IngestorStats {
        let buffer = self.buffer.stats();
        IngestorStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_persisted: self.events_persisted.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            late_events: self.late_events.load(Ordering::Relaxed),
            events_dropped: buffer.dropped,
            events_rejected: buffer.rejected,
            current_buffer_size: buffer.current_size,
            buffer_utilization_percent: buffer.utilization_percent,
        }
    }

    /// Run the flush/sweep/cleanup cycle until `shutdown` flips to true
    pub fn spawn_cycle(
        self: &Arc<Self>,
        config: &IngestionConfig,
        retention: RetentionConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let ingestor = Arc::clone(self);
        let mut flush_timer = interval(config.flush_interval());
        let mut sweep_timer = interval(config.sweep_interval());
        let mut cleanup_timer = interval(config.cleanup_interval());
        for timer in [&mut flush_timer, &mut sweep_timer, &mut cleanup_timer] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        tokio::spawn(async move {
            info!("Starting ingestion cycle");
            let mut queued_alerts = ingestor.alert_rx.lock().await;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }

                    Some(alert) = queued_alerts.recv() => {
                        ingestor.deliver_alert(alert).await;
                    }

                    _ = ingestor.flush_requested.notified() => {
                        ingestor.flush_cycle("batch_full").await;
                    }

                    _ = flush_timer.tick() => {
                        ingestor.flush_cycle("interval").await;
                    }

                    _ = sweep_timer.tick() => {
                        if let Err(e) = ingestor.sweep().await {
                            error!(error = %e, "Window sweep failed");
                        }
                    }

                    _ = cleanup_timer.tick() => {
                        if let Err(e) = ingestor.cleanup(&retention).await {
                            error!(error = %e, "Retention cleanup failed");
                        }
                    }
                }
            }
            info!("Ingestion cycle stopped");
        })
    }

    async fn flush_cycle(&self, trigger: &str) {
        if self.buffer.is_empty() {
            return;
        }
        match self.flush().await {
            Ok(written) => debug!(trigger, written, "Flush cycle complete"),
            Err(e) => error!(trigger, error = %e, "Flush cycle failed"),
        }
    }
}

impl std::fmt::Debug for EventIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventIngestor")
            .field("batch_size", &self.batch_size)
            .field("backend", &self.gateway.backend_name())
            .field("buffer", &self.buffer.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertKind, RecordingAlertSink};
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use processor::InMemoryGateway;
    use usage_analytics_config::OverflowStrategy;
    use usage_analytics_types::{AiRequest, Resolution};

    struct Fixture {
        ingestor: EventIngestor,
        gateway: Arc<InMemoryGateway>,
        sink: Arc<RecordingAlertSink>,
        clock: Arc<ManualClock>,
    }

    fn fixture(config: IngestionConfig) -> Fixture {
        let gateway = Arc::new(InMemoryGateway::new());
        let sink = Arc::new(RecordingAlertSink::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap(),
        ));
        let aggregator = Arc::new(MultiResolutionAggregator::new([Resolution::OneMinute], 10));
        let ingestor = EventIngestor::new(
            &config,
            aggregator,
            gateway.clone(),
            sink.clone(),
            true,
            clock.clone(),
        );
        Fixture {
            ingestor,
            gateway,
            sink,
            clock,
        }
    }

    fn request() -> EventDraft {
        EventDraft::from(AiRequest::new("chat", "gpt-4o", "openai", 120.0, 30, 0.01))
    }

    #[tokio::test]
    async fn test_track_stamps_with_clock() {
        let f = fixture(IngestionConfig::default());
        let event = f.ingestor.track(request()).await.unwrap();

        assert_eq!(event.timestamp, f.clock.now());
        assert_eq!(f.ingestor.stats().events_received, 1);
        assert_eq!(f.ingestor.stats().current_buffer_size, 1);
    }

    #[tokio::test]
    async fn test_invalid_event_is_refused() {
        let f = fixture(IngestionConfig::default());
        let bad = EventDraft::from(AiRequest::new("chat", "gpt-4o", "openai", -5.0, 30, 0.01));

        let err = f.ingestor.track(bad).await.unwrap_err();
        assert!(matches!(err, CollectorError::InvalidEvent(_)));
        assert_eq!(f.ingestor.stats().events_received, 0);
    }

    #[tokio::test]
    async fn test_flush_writes_in_batches() {
        let config = IngestionConfig {
            batch_size: 4,
            ..Default::default()
        };
        let f = fixture(config);
        for _ in 0..10 {
            f.ingestor.track(request()).await.unwrap();
        }

        assert_eq!(f.ingestor.flush().await.unwrap(), 10);
        let stats = f.ingestor.stats();
        assert_eq!(stats.batches_flushed, 3);
        assert_eq!(stats.events_persisted, 10);
        assert_eq!(stats.current_buffer_size, 0);
        assert_eq!(f.gateway.stats().stored_events, 10);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_batch() {
        let f = fixture(IngestionConfig::default());
        let first = f.ingestor.track(request()).await.unwrap();
        f.clock.advance(ChronoDuration::seconds(1));
        f.ingestor.track(request()).await.unwrap();

        f.gateway.fail_next_writes(1);
        assert!(f.ingestor.flush().await.is_err());
        assert_eq!(f.ingestor.stats().current_buffer_size, 2);
        assert_eq!(f.ingestor.stats().flush_failures, 1);

        assert_eq!(f.ingestor.flush().await.unwrap(), 2);
        assert_eq!(f.gateway.events()[0].id, first.id);
    }

    #[tokio::test]
    async fn test_reject_new_returns_error_and_alerts() {
        let config = IngestionConfig {
            batch_size: 2,
            max_buffer_size: 2,
            overflow_strategy: OverflowStrategy::RejectNew,
            ..Default::default()
        };
        let f = fixture(config);
        f.ingestor.track(request()).await.unwrap();
        f.ingestor.track(request()).await.unwrap();

        let err = f.ingestor.track(request()).await.unwrap_err();
        assert!(matches!(err, CollectorError::BufferFull { capacity: 2 }));
        assert_eq!(f.ingestor.stats().events_rejected, 1);
        assert_eq!(f.sink.count(AlertKind::BufferOverflow), 0);

        assert_eq!(f.ingestor.deliver_pending_alerts().await, 1);
        assert_eq!(f.sink.count(AlertKind::BufferOverflow), 1);
    }

    struct StalledSink;

    #[async_trait::async_trait]
    impl AlertSink for StalledSink {
        async fn send(&self, _alert: Alert) -> anyhow::Result<()> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_overflow_does_not_wait_for_alert_sink() {
        let config = IngestionConfig {
            batch_size: 2,
            max_buffer_size: 2,
            overflow_strategy: OverflowStrategy::DropOldest,
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap(),
        ));
        let ingestor = EventIngestor::new(
            &config,
            Arc::new(MultiResolutionAggregator::new([Resolution::OneMinute], 10)),
            Arc::new(InMemoryGateway::new()),
            Arc::new(StalledSink),
            true,
            clock,
        );

        for _ in 0..3 {
            let tracked =
                tokio::time::timeout(std::time::Duration::from_millis(500), ingestor.track(request()))
                    .await;
            assert!(matches!(tracked, Ok(Ok(_))));
        }
        assert_eq!(ingestor.stats().events_dropped, 1);
        assert_eq!(ingestor.stats().current_buffer_size, 2);
    }

    #[tokio::test]
    async fn test_cycle_delivers_overflow_alerts() {
        let config = IngestionConfig {
            max_buffer_size: 1,
            flush_interval_ms: 60_000,
            sweep_interval_ms: 60_000,
            overflow_strategy: OverflowStrategy::DropNewest,
            ..Default::default()
        };
        let f = fixture(config.clone());
        let ingestor = Arc::new(f.ingestor);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let cycle = ingestor.spawn_cycle(&config, RetentionConfig::default(), shutdown_rx);

        ingestor.track(request()).await.unwrap();
        ingestor.track(request()).await.unwrap();
        ingestor.track(request()).await.unwrap();

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.sink.count(AlertKind::BufferOverflow), 2);

        shutdown.send(true).unwrap();
        cycle.await.unwrap();
        assert_eq!(ingestor.deliver_pending_alerts().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_applies_both_retention_periods() {
        let f = fixture(IngestionConfig::default());
        let now = f.clock.now();
        let old = EventDraft::from(AiRequest::new("chat", "m", "p", 1.0, 1, 0.0))
            .at(now - ChronoDuration::days(10))
            .finalize(now);
        f.gateway.insert_events(&[old]).await.unwrap();
        f.ingestor.track(request()).await.unwrap();
        f.ingestor.flush().await.unwrap();

        let report = f
            .ingestor
            .cleanup(&RetentionConfig {
                raw_days: 7,
                aggregated_days: 90,
            })
            .await
            .unwrap();
        assert_eq!(report.raw_events_removed, 1);
        assert_eq!(report.rollups_removed, 0);
        assert_eq!(f.gateway.stats().stored_events, 1);
    }

    #[tokio::test]
    async fn test_sweep_uses_clock() {
        let f = fixture(IngestionConfig::default());
        f.ingestor.track(request()).await.unwrap();

        assert!(f.ingestor.sweep().await.unwrap().is_empty());
        f.clock.advance(ChronoDuration::minutes(1));
        assert_eq!(f.ingestor.sweep().await.unwrap().flushed.len(), 1);
        assert_eq!(f.gateway.stats().stored_rollups, 1);
    }
}
