//! Usage analytics engine
//!
//! [`UsageAnalytics`] wires the ingestor, the live aggregator, the analysis
//! components and the persistence gateway together. It is constructed
//! explicitly from configuration, a gateway, an alert sink and a clock, and
//! owns the background cycle until [`UsageAnalytics::stop`] is called.
//!
//! Queries combine what has been persisted with what is still live: range
//! queries merge gateway rollups with open windows, and filtered queries
//! rebuild windows from stored plus still-buffered raw events.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use usage_analytics_config::AnalyticsConfig;
use usage_analytics_types::{
    AiRequest, ComparisonResult, EventDraft, Resolution, SeriesMetric, TimeRange, UsageEvent,
};

use analyzer::{AnomalyDetector, Comparator, ComparisonOptions, Forecaster, MetricsCalculator};
use processor::storage::series;
use processor::{
    AggregatorStats, InMemoryGateway, MultiResolutionAggregator, PersistenceGateway, SeriesFilter,
    SweepReport, TopN, WindowKey, WindowMetrics,
};

use crate::alerts::{latency_breach, window_breaches, Alert, AlertSink, LoggingAlertSink};
use crate::cache::ResultCache;
use crate::clock::{Clock, SystemClock};
use crate::error::{CollectorError, Result};
use crate::ingestor::{EventIngestor, IngestorStats, RetentionReport};
use crate::report::{
    key_part, AnalysisOptions, AnalysisReport, MetricForecast, MetricReport, FORECAST_METRICS,
    REPORT_METRICS,
};

/// Engine statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub ingestion: IngestorStats,
    pub aggregation: AggregatorStats,
    pub cached_reports: usize,
    pub cached_comparisons: usize,
}

pub struct UsageAnalytics {
    config: AnalyticsConfig,
    aggregator: Arc<MultiResolutionAggregator>,
    ingestor: Arc<EventIngestor>,
    gateway: Arc<dyn PersistenceGateway>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    calculator: MetricsCalculator,
    detector: AnomalyDetector,
    forecaster: Forecaster,
    comparator: Comparator,
    reports: ResultCache<AnalysisReport>,
    comparisons: ResultCache<ComparisonResult>,
    shutdown: watch::Sender<bool>,
    cycle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    /// Set once the final flush has succeeded
    drained: AtomicBool,
    stop_lock: tokio::sync::Mutex<()>,
}

impl UsageAnalytics {
    /// Validate `config`, build the components and start the background cycle
    pub async fn start(
        config: AnalyticsConfig,
        gateway: Arc<dyn PersistenceGateway>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let aggregator = Arc::new(MultiResolutionAggregator::from_config(&config.aggregation));
        let ingestor = Arc::new(EventIngestor::new(
            &config.ingestion,
            Arc::clone(&aggregator),
            Arc::clone(&gateway),
            Arc::clone(&alerts),
            config.alerts.enabled,
            Arc::clone(&clock),
        ));

        let cache_ttl = ChronoDuration::from_std(config.analysis.cache_ttl())
            .map_err(|e| anyhow::anyhow!("cache ttl out of range: {}", e))?;
        let forecaster = Forecaster::from_config(&config.analysis)?;
        let comparator = Comparator::new(config.analysis.confidence_level)?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let cycle = ingestor.spawn_cycle(&config.ingestion, config.retention.clone(), shutdown_rx);

        info!(
            backend = gateway.backend_name(),
            resolutions = ?config.aggregation.resolutions,
            batch_size = config.ingestion.batch_size,
            "Usage analytics engine started"
        );

        Ok(Self {
            calculator: MetricsCalculator::from_config(&config.analysis),
            detector: AnomalyDetector::from_config(&config.analysis),
            forecaster,
            comparator,
            reports: ResultCache::new(config.analysis.cache_capacity, cache_ttl),
            comparisons: ResultCache::new(config.analysis.cache_capacity, cache_ttl),
            config,
            aggregator,
            ingestor,
            gateway,
            alerts,
            clock,
            shutdown,
            cycle: parking_lot::Mutex::new(Some(cycle)),
            running: AtomicBool::new(true),
            drained: AtomicBool::new(false),
            stop_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Engine over an in-memory gateway, logging alerts and the wall clock
    pub async fn in_memory(config: AnalyticsConfig) -> Result<Self> {
        Self::start(
            config,
            Arc::new(InMemoryGateway::new()),
            Arc::new(LoggingAlertSink),
            Arc::new(SystemClock),
        )
        .await
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(CollectorError::Stopped)
        }
    }

    /// Ingest an event, assigning id and timestamp where missing
    pub async fn track(&self, event: impl Into<EventDraft>) -> Result<UsageEvent> {
        self.ensure_running()?;
        self.ingestor.track(event.into()).await
    }

    /// Ingest a model request attributed to an optional user and session
    pub async fn track_ai_request(
        &self,
        request: AiRequest,
        user_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<UsageEvent> {
        let mut draft = EventDraft::from(request);
        if let Some(user) = user_id {
            draft = draft.with_user(user);
        }
        if let Some(session) = session_id {
            draft = draft.with_session(session);
        }
        self.track(draft).await
    }

    /// Copy of the live window containing the current time
    pub fn realtime_metrics(&self, resolution: Resolution) -> Result<WindowMetrics> {
        self.realtime_metrics_at(resolution, self.clock.now())
    }

    pub fn realtime_metrics_at(
        &self,
        resolution: Resolution,
        at: DateTime<Utc>,
    ) -> Result<WindowMetrics> {
        self.aggregator
            .realtime(resolution, at)
            .ok_or(CollectorError::UntrackedResolution(resolution))
    }

    /// Persisted rollups at `resolution` starting within `range`
    pub async fn historical_metrics(
        &self,
        resolution: Resolution,
        range: TimeRange,
    ) -> Result<Vec<WindowMetrics>> {
        Ok(self.gateway.query_rollups(resolution, range).await?)
    }

    /// Windows covering `range`, persisted and live
    async fn windows_for(&self, filter: &SeriesFilter, range: TimeRange) -> Result<Vec<WindowMetrics>> {
        if filter.needs_raw_events() {
            let mut events = self.gateway.query_events(range).await?;
            let mut seen: HashSet<_> = events.iter().map(|e| e.id).collect();
            events.extend(
                self.ingestor
                    .pending_events(range)
                    .into_iter()
                    .filter(|e| seen.insert(e.id)),
            );
            return Ok(series::windows_from_events(&events, filter));
        }

        // Live windows first: one flushed in between shows up in the gateway read
        let mut windows: BTreeMap<WindowKey, WindowMetrics> = self
            .aggregator
            .live_windows(filter.resolution)
            .into_iter()
            .filter(|w| range.contains(w.start))
            .map(|w| (w.key(), w))
            .collect();
        for rollup in self.gateway.query_rollups(filter.resolution, range).await? {
            windows.insert(rollup.key(), rollup);
        }
        Ok(windows.into_values().collect())
    }

    /// Summaries, anomalies, forecasts and rankings over `options.range`
    pub async fn analyze_ai_performance(&self, options: &AnalysisOptions) -> Result<AnalysisReport> {
        let now = self.clock.now();
        let key = options.cache_key();
        if let Some(report) = self.reports.get(&key, now) {
            debug!(key = %key, "Serving cached analysis report");
            return Ok(report);
        }

        let windows = self
            .windows_for(&options.filter(SeriesMetric::Throughput), options.range)
            .await?;
        let mut pending_alerts = Vec::new();

        let mut metrics = BTreeMap::new();
        for metric in REPORT_METRICS {
            let points = series::series_from_rollups(&windows, metric);
            let summary = self.calculator.summarize(&points);
            let anomalies = self.detector.detect(&points);

            pending_alerts.extend(
                anomalies
                    .iter()
                    .filter(|a| a.severity.is_alertable())
                    .map(|a| Alert::anomaly(metric, a, now)),
            );
            if metric == SeriesMetric::Latency && summary.count > 0 {
                pending_alerts.extend(latency_breach(
                    &self.config.alerts,
                    summary.p95,
                    options.range,
                    now,
                ));
            }
            metrics.insert(metric, MetricReport { summary, anomalies });
        }
        pending_alerts.extend(
            windows
                .iter()
                .flat_map(|w| window_breaches(&self.config.alerts, w, now)),
        );

        let mut forecasts = BTreeMap::new();
        if options.include_forecast {
            for metric in FORECAST_METRICS {
                let points = series::series_from_rollups(&windows, metric);
                forecasts.insert(
                    metric,
                    MetricForecast {
                        linear: self.forecaster.linear(&points),
                        horizons: self.forecaster.horizons(&points),
                    },
                );
            }
        }

        let top_n = self.config.aggregation.top_n;
        let report = AnalysisReport {
            range: options.range,
            resolution: options.resolution,
            windows: windows.len(),
            metrics,
            forecasts,
            top_features: TopN::merge(windows.iter().map(|w| w.top_features.as_slice()), top_n),
            top_models: TopN::merge(windows.iter().map(|w| w.top_models.as_slice()), top_n),
            realtime: self.aggregator.realtime(options.resolution, now),
            alerts_raised: self.raise(pending_alerts).await,
            generated_at: now,
        };

        info!(
            range = %options.range,
            resolution = %options.resolution,
            windows = report.windows,
            alerts = report.alerts_raised,
            "Generated analysis report"
        );
        self.reports.insert(key, report.clone(), now);
        Ok(report)
    }

    /// Significance-tested comparison of two ranges
    pub async fn compare_performance(
        &self,
        baseline: TimeRange,
        comparison: TimeRange,
        options: &ComparisonOptions,
    ) -> Result<ComparisonResult> {
        let now = self.clock.now();
        let key = comparison_cache_key(baseline, comparison, options);
        if let Some(result) = self.comparisons.get(&key, now) {
            debug!(key = %key, "Serving cached comparison");
            return Ok(result);
        }

        let comparator = match options.confidence_level {
            Some(level) => Comparator::new(level)?,
            None => self.comparator.clone(),
        };
        let filter = options.filter(SeriesMetric::Throughput);
        let before = self.windows_for(&filter, baseline).await?;
        let after = self.windows_for(&filter, comparison).await?;

        let series: Vec<_> = options
            .metrics
            .iter()
            .map(|&metric| {
                (
                    metric,
                    series::series_from_rollups(&before, metric),
                    series::series_from_rollups(&after, metric),
                )
            })
            .collect();
        let result = comparator.compare_series(baseline, comparison, &series)?;

        info!(
            baseline = %baseline,
            comparison = %comparison,
            score = result.overall_improvement_score,
            "Compared performance"
        );
        self.comparisons.insert(key, result.clone(), now);
        Ok(result)
    }

    async fn raise(&self, alerts: Vec<Alert>) -> usize {
        if !self.config.alerts.enabled {
            return 0;
        }
        let mut delivered = 0;
        for alert in alerts {
            let kind = alert.kind;
            match self.alerts.send(alert).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(%kind, error = %e, "Failed to deliver alert"),
            }
        }
        delivered
    }

    /// Write buffered events now instead of waiting for the cycle
    pub async fn flush_now(&self) -> Result<usize> {
        self.ingestor.flush().await
    }

    /// Persist windows completed by the current clock time
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        self.ingestor.sweep().await
    }

    /// Apply the retention periods now
    pub async fn cleanup_now(&self) -> Result<RetentionReport> {
        self.ingestor.cleanup(&self.config.retention).await
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            ingestion: self.ingestor.stats(),
            aggregation: self.aggregator.stats(),
            cached_reports: self.reports.len(),
            cached_comparisons: self.comparisons.len(),
        }
    }

    /// Stop the cycle, then flush buffered events and every live window
    ///
    /// Further `track` calls fail with [`CollectorError::Stopped`]. If the
    /// final flush fails the error is returned and the next `stop` retries
    /// it; once it has succeeded, `stop` is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.stop_lock.lock().await;
        if self.drained.load(Ordering::SeqCst) {
            return Ok(());
        }

        if self.running.swap(false, Ordering::SeqCst) {
            info!("Stopping usage analytics engine");
            let _ = self.shutdown.send(true);
        } else {
            info!("Retrying final flush");
        }
        let cycle = self.cycle.lock().take();
        let timeout = self.config.ingestion.shutdown_timeout();

        let drain = async {
            if let Some(handle) = cycle {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Ingestion cycle ended abnormally");
                }
            }
            self.ingestor.deliver_pending_alerts().await;
            let events = self.ingestor.flush().await?;
            let report = self.aggregator.flush_all(self.gateway.as_ref()).await?;
            info!(
                events,
                windows = report.flushed.len(),
                "Final flush complete"
            );
            Ok::<(), CollectorError>(())
        };

        tokio::time::timeout(timeout, drain)
            .await
            .map_err(|_| CollectorError::ShutdownTimeout(timeout))??;
        self.drained.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn comparison_cache_key(
    baseline: TimeRange,
    comparison: TimeRange,
    options: &ComparisonOptions,
) -> String {
    let metrics: Vec<&str> = options.metrics.iter().map(|m| m.as_str()).collect();
    format!(
        "comparison:{}:{}:{}:{}:{}:{}:{}:{}:{:?}",
        baseline.start.timestamp_millis(),
        baseline.end.timestamp_millis(),
        comparison.start.timestamp_millis(),
        comparison.end.timestamp_millis(),
        options.resolution,
        key_part(options.feature_id.as_deref()),
        key_part(options.model.as_deref()),
        metrics.join(","),
        options.confidence_level
    )
}

impl Drop for UsageAnalytics {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.shutdown.send(true);
        }
    }
}

impl std::fmt::Debug for UsageAnalytics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageAnalytics")
            .field("backend", &self.gateway.backend_name())
            .field("running", &self.is_running())
            .field("aggregator", &self.aggregator)
            .finish()
    }
}
