//! Metric series derived from rollups or raw events

use std::collections::BTreeMap;
use tracing::trace;
use usage_analytics_types::{SeriesMetric, TimeSeriesPoint, UsageEvent};

use super::gateway::SeriesFilter;
use crate::aggregation::{AggregationWindow, WindowMetrics};
use crate::window::{BucketAssigner, WindowKey};

/// Value of `metric` for one window, `None` when the window has no samples for it
pub fn metric_value(window: &WindowMetrics, metric: SeriesMetric) -> Option<f64> {
    match metric {
        SeriesMetric::Latency => (window.latency_samples > 0).then_some(window.avg_latency_ms),
        SeriesMetric::CacheHitRate => (window.cache_samples > 0).then_some(window.cache_hit_rate),
        SeriesMetric::Cost => Some(window.total_cost),
        SeriesMetric::Throughput => Some(window.total_requests as f64),
        SeriesMetric::Tokens => Some(window.total_tokens as f64),
        SeriesMetric::ErrorRate => (window.total_requests > 0).then_some(window.error_rate),
        SeriesMetric::Accuracy => (window.total_requests > 0).then_some(1.0 - window.error_rate),
    }
}

/// One point per window, ordered by window start
pub fn series_from_rollups(rollups: &[WindowMetrics], metric: SeriesMetric) -> Vec<TimeSeriesPoint> {
    let mut points: Vec<TimeSeriesPoint> = rollups
        .iter()
        .filter_map(|w| {
            metric_value(w, metric).map(|value| {
                TimeSeriesPoint::new(w.start, value)
                    .with_metadata("resolution", w.resolution.label())
                    .with_metadata("requests", w.total_requests.to_string())
            })
        })
        .collect();
    points.sort_by_key(|p| p.timestamp);
    points
}

/// Rebuild per-bucket windows from the events matching `filter`
pub fn windows_from_events(events: &[UsageEvent], filter: &SeriesFilter) -> Vec<WindowMetrics> {
    let resolution = filter.resolution;
    let mut windows: BTreeMap<i64, AggregationWindow> = BTreeMap::new();

    let mut ordered: Vec<&UsageEvent> = events.iter().filter(|e| filter.matches(e)).collect();
    ordered.sort_by_key(|e| e.timestamp);

    for event in ordered {
        let bucket = resolution.bucket_key(event.timestamp);
        let window = windows.entry(bucket).or_insert_with(|| {
            AggregationWindow::new(
                WindowKey::new(resolution, bucket),
                BucketAssigner::bounds(resolution, event.timestamp),
                usage_analytics_config::MAX_TOP_N,
            )
        });
        if let Err(e) = window.apply(event) {
            trace!(event_id = %event.id, error = %e, "Event skipped while rebuilding window");
        }
    }

    windows.values().map(AggregationWindow::snapshot).collect()
}

/// Series of `filter.metric` over the matching events, one point per bucket
pub fn series_from_events(events: &[UsageEvent], filter: &SeriesFilter) -> Vec<TimeSeriesPoint> {
    let windows = windows_from_events(events, filter);
    series_from_rollups(&windows, filter.metric)
}
