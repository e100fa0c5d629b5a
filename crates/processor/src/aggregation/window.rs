//! Per-bucket accumulator and its snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use usage_analytics_types::{Resolution, UsageEvent};

use super::running::RunningMean;
use super::top_n::{TopEntry, TopN};
use crate::error::{WindowError, WindowResult};
use crate::window::{WindowBounds, WindowKey, WindowState};

/// Point-in-time copy of a window's statistics
///
/// Returned by live queries and persisted as a rollup once the window has
/// been closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowMetrics {
    pub resolution: Resolution,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub state: WindowState,
    pub total_requests: u64,
    pub avg_latency_ms: f64,
    pub latency_samples: u64,
    pub cache_hit_rate: f64,
    pub cache_samples: u64,
    pub error_rate: f64,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub top_features: Vec<TopEntry>,
    pub top_models: Vec<TopEntry>,
}

impl WindowMetrics {
    /// Metrics of a bucket that has seen no events
    pub fn empty(resolution: Resolution, bounds: WindowBounds) -> Self {
        Self {
            resolution,
            start: bounds.start,
            end: bounds.end,
            state: WindowState::Open,
            total_requests: 0,
            avg_latency_ms: 0.0,
            latency_samples: 0,
            cache_hit_rate: 0.0,
            cache_samples: 0,
            error_rate: 0.0,
            total_cost: 0.0,
            total_tokens: 0,
            top_features: Vec::new(),
            top_models: Vec::new(),
        }
    }

    pub fn key(&self) -> WindowKey {
        WindowKey::new(self.resolution, self.start.timestamp_millis())
    }

    pub fn bounds(&self) -> WindowBounds {
        WindowBounds::new(self.start, self.end)
    }

    pub fn error_count(&self) -> u64 {
        (self.error_rate * self.total_requests as f64).round() as u64
    }
}

/// Live accumulator for one (resolution, bucket) pair
#[derive(Debug, Clone)]
pub struct AggregationWindow {
    key: WindowKey,
    bounds: WindowBounds,
    state: WindowState,
    total_requests: u64,
    latency: RunningMean,
    cache_hit: RunningMean,
    error_rate: RunningMean,
    total_cost: f64,
    total_tokens: u64,
    top_features: TopN,
    top_models: TopN,
}

impl AggregationWindow {
    pub fn new(key: WindowKey, bounds: WindowBounds, top_n: usize) -> Self {
        Self {
            key,
            bounds,
            state: WindowState::Open,
            total_requests: 0,
            latency: RunningMean::new(),
            cache_hit: RunningMean::new(),
            error_rate: RunningMean::new(),
            total_cost: 0.0,
            total_tokens: 0,
            top_features: TopN::new(top_n),
            top_models: TopN::new(top_n),
        }
    }

    pub fn key(&self) -> WindowKey {
        self.key
    }

    pub fn bounds(&self) -> WindowBounds {
        self.bounds
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    /// Fold one event into the running statistics
    ///
    /// Fails without touching any statistic once the window has left `Open`.
    pub fn apply(&mut self, event: &UsageEvent) -> WindowResult<()> {
        if !self.state.accepts_events() {
            return Err(WindowError::WindowNotOpen {
                window_id: self.key.to_string(),
                state: self.state,
            });
        }

        self.total_requests += 1;
        if let Some(latency) = event.latency_ms() {
            self.latency.push(latency);
        }
        if let Some(hit) = event.cache_hit() {
            self.cache_hit.push_flag(hit);
        }
        self.error_rate.push_flag(event.is_error());

        let cost = event.cost();
        self.total_cost += cost;
        self.total_tokens += event.tokens();

        if let Some(feature) = event.feature_id() {
            self.top_features.record(feature, cost);
        }
        if let Some(model) = event.model() {
            self.top_models.record(model, cost);
        }

        Ok(())
    }

    /// Advance to the next lifecycle state
    pub fn transition(&mut self, to: WindowState) -> WindowResult<()> {
        if self.state.next() != Some(to) {
            return Err(WindowError::InvalidTransition {
                window_id: self.key.to_string(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Close the window if it is still open; returns whether it was
    pub fn close(&mut self) -> bool {
        if self.state == WindowState::Open {
            self.state = WindowState::Closed;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> WindowMetrics {
        WindowMetrics {
            resolution: self.key.resolution,
            start: self.bounds.start,
            end: self.bounds.end,
            state: self.state,
            total_requests: self.total_requests,
            avg_latency_ms: self.latency.mean(),
            latency_samples: self.latency.count(),
            cache_hit_rate: self.cache_hit.mean(),
            cache_samples: self.cache_hit.count(),
            error_rate: self.error_rate.mean(),
            total_cost: self.total_cost,
            total_tokens: self.total_tokens,
            top_features: self.top_features.entries(),
            top_models: self.top_models.entries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::BucketAssigner;
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use usage_analytics_types::{AiRequest, EventDraft, EventPayload};

    fn window_at(ts: DateTime<Utc>) -> AggregationWindow {
        let res = Resolution::OneMinute;
        AggregationWindow::new(
            WindowKey::new(res, res.bucket_key(ts)),
            BucketAssigner::bounds(res, ts),
            10,
        )
    }

    fn request(feature: &str, latency: f64, cost: f64) -> AiRequest {
        AiRequest::new(feature, "gpt-4o", "openai", latency, 100, cost)
    }

    #[test]
    fn test_sequential_updates_match_arithmetic_mean() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 10).unwrap();
        let mut window = window_at(ts);
        let latencies = [120.0, 340.0, 95.5, 1020.0, 77.0, 410.25];

        for (i, latency) in latencies.iter().enumerate() {
            let mut req = request("chat", *latency, 0.01);
            if i % 2 == 0 {
                req = req.cached();
            }
            let event = EventDraft::from(req).at(ts).finalize(ts);
            window.apply(&event).unwrap();
        }

        let snapshot = window.snapshot();
        let expected = latencies.iter().sum::<f64>() / latencies.len() as f64;
        assert_relative_eq!(snapshot.avg_latency_ms, expected, epsilon = 1e-9);
        assert_relative_eq!(snapshot.cache_hit_rate, 0.5, epsilon = 1e-12);
        assert_relative_eq!(snapshot.total_cost, 0.06, epsilon = 1e-12);
        assert_eq!(snapshot.total_requests, 6);
        assert_eq!(snapshot.total_tokens, 600);
        assert_eq!(snapshot.top_models[0].requests, 6);
    }

    #[test]
    fn test_per_metric_sample_counts() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 10).unwrap();
        let mut window = window_at(ts);

        let events = [
            EventDraft::from(request("chat", 200.0, 0.02)),
            EventDraft::from(request("chat", 400.0, 0.02).failed("timeout")),
            EventDraft::new(EventPayload::FeatureUsage {
                feature_id: "export".into(),
                action: "click".into(),
                duration_ms: None,
            }),
            EventDraft::new(EventPayload::Error {
                feature_id: None,
                message: "boom".into(),
                code: Some("E500".into()),
            }),
        ];
        for draft in events {
            window.apply(&draft.at(ts).finalize(ts)).unwrap();
        }

        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_requests, 4);
        assert_eq!(snapshot.latency_samples, 2);
        assert_relative_eq!(snapshot.avg_latency_ms, 300.0);
        assert_eq!(snapshot.cache_samples, 2);
        assert_relative_eq!(snapshot.error_rate, 0.5);
        assert_eq!(snapshot.error_count(), 2);
        assert_eq!(snapshot.top_features.len(), 2);
        assert_eq!(snapshot.top_models.len(), 1);
    }

    #[test]
    fn test_closed_window_rejects_events() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 10).unwrap();
        let mut window = window_at(ts);
        let event = EventDraft::from(request("chat", 10.0, 0.0)).at(ts).finalize(ts);

        window.apply(&event).unwrap();
        assert!(window.close());
        assert!(!window.close());

        let err = window.apply(&event).unwrap_err();
        assert!(matches!(err, WindowError::WindowNotOpen { .. }));
        assert_eq!(window.total_requests(), 1);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 10).unwrap();
        let mut window = window_at(ts);

        assert!(window.transition(WindowState::Flushed).is_err());
        window.transition(WindowState::Closed).unwrap();
        window.transition(WindowState::Flushed).unwrap();
        assert!(window.transition(WindowState::Closed).is_err());
        window.transition(WindowState::Evicted).unwrap();
        assert_eq!(window.state(), WindowState::Evicted);
    }
}
