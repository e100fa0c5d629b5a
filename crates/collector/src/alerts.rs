//! Alert delivery
//!
//! The engine reports high-severity anomalies, threshold breaches and buffer
//! overflows to an [`AlertSink`]. Delivery to email, webhooks or chat is
//! left to sink implementations outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};
use usage_analytics_config::AlertConfig;
use usage_analytics_types::{AnomalyPoint, AnomalySeverity, SeriesMetric, TimeRange};
use uuid::Uuid;

use processor::WindowMetrics;

/// Alert category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Anomaly,
    ThresholdBreach,
    BufferOverflow,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Anomaly => "anomaly",
            Self::ThresholdBreach => "threshold_breach",
            Self::BufferOverflow => "buffer_overflow",
        };
        f.write_str(s)
    }
}

/// Alert information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub kind: AlertKind,
    pub severity: AnomalySeverity,
    pub message: String,
    /// Opaque details for the receiving channel
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        severity: AnomalySeverity,
        message: impl Into<String>,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            message: message.into(),
            payload,
            timestamp,
        }
    }

    /// Alert for a detected anomaly in a metric series
    pub fn anomaly(metric: SeriesMetric, anomaly: &AnomalyPoint, now: DateTime<Utc>) -> Self {
        Self::new(
            AlertKind::Anomaly,
            anomaly.severity,
            format!(
                "{} anomaly in {}: observed {:.4}, expected {:.4}",
                anomaly.severity, metric, anomaly.value, anomaly.expected
            ),
            serde_json::json!({
                "metric": metric,
                "anomaly": anomaly,
            }),
            now,
        )
    }

    /// Alert for events lost or refused at the ingest buffer
    pub fn buffer_overflow(strategy: &str, capacity: usize, now: DateTime<Utc>) -> Self {
        Self::new(
            AlertKind::BufferOverflow,
            AnomalySeverity::High,
            format!("Ingest buffer full ({} events), applying {}", capacity, strategy),
            serde_json::json!({
                "capacity": capacity,
                "strategy": strategy,
            }),
            now,
        )
    }
}

fn breach(
    name: &str,
    value: f64,
    limit: f64,
    details: serde_json::Value,
    now: DateTime<Utc>,
) -> Alert {
    Alert::new(
        AlertKind::ThresholdBreach,
        AnomalySeverity::High,
        format!("{} {:.4} exceeds {:.4}", name, value, limit),
        serde_json::json!({
            "metric": name,
            "value": value,
            "threshold": limit,
            "details": details,
        }),
        now,
    )
}

/// Error-rate and cost checks against one window
pub fn window_breaches(config: &AlertConfig, window: &WindowMetrics, now: DateTime<Utc>) -> Vec<Alert> {
    let details = serde_json::json!({
        "resolution": window.resolution,
        "window_start": window.start,
        "requests": window.total_requests,
    });
    let mut alerts = Vec::new();

    if let Some(limit) = config.max_error_rate {
        if window.total_requests > 0 && window.error_rate > limit {
            alerts.push(breach("error_rate", window.error_rate, limit, details.clone(), now));
        }
    }
    if let Some(limit) = config.max_window_cost {
        if window.total_cost > limit {
            alerts.push(breach("window_cost", window.total_cost, limit, details, now));
        }
    }
    alerts
}

/// p95 latency check over a whole range
pub fn latency_breach(
    config: &AlertConfig,
    p95_latency_ms: f64,
    range: TimeRange,
    now: DateTime<Utc>,
) -> Option<Alert> {
    let limit = config.max_p95_latency_ms?;
    (p95_latency_ms > limit).then(|| {
        breach(
            "p95_latency_ms",
            p95_latency_ms,
            limit,
            serde_json::json!({ "range": range }),
            now,
        )
    })
}

/// Receiver of engine alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: Alert) -> anyhow::Result<()>;
}

/// Sink that writes alerts to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingAlertSink;

#[async_trait]
impl AlertSink for LoggingAlertSink {
    async fn send(&self, alert: Alert) -> anyhow::Result<()> {
        if alert.severity >= AnomalySeverity::High {
            warn!(
                alert_id = %alert.id,
                kind = %alert.kind,
                severity = %alert.severity,
                "{}",
                alert.message
            );
        } else {
            info!(
                alert_id = %alert.id,
                kind = %alert.kind,
                severity = %alert.severity,
                "{}",
                alert.message
            );
        }
        Ok(())
    }
}

/// Sink that keeps every alert in memory
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn count(&self, kind: AlertKind) -> usize {
        self.alerts.lock().iter().filter(|a| a.kind == kind).count()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn send(&self, alert: Alert) -> anyhow::Result<()> {
        self.alerts.lock().push(alert);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use processor::{WindowBounds, WindowState};
    use usage_analytics_types::Resolution;

    fn window(requests: u64, error_rate: f64, cost: f64) -> WindowMetrics {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let bounds = WindowBounds::new(start, start + Resolution::OneHour.duration());
        let mut w = WindowMetrics::empty(Resolution::OneHour, bounds);
        w.state = WindowState::Closed;
        w.total_requests = requests;
        w.error_rate = error_rate;
        w.total_cost = cost;
        w
    }

    #[test]
    fn test_window_breaches() {
        let config = AlertConfig {
            enabled: true,
            max_error_rate: Some(0.05),
            max_p95_latency_ms: Some(1000.0),
            max_window_cost: Some(10.0),
        };
        let now = Utc::now();

        assert!(window_breaches(&config, &window(100, 0.01, 2.0), now).is_empty());

        let noisy = window_breaches(&config, &window(100, 0.2, 25.0), now);
        assert_eq!(noisy.len(), 2);
        assert!(noisy.iter().all(|a| a.kind == AlertKind::ThresholdBreach));
        assert_eq!(noisy[0].payload["metric"], "error_rate");
        assert_eq!(noisy[1].payload["metric"], "window_cost");
    }

    #[test]
    fn test_empty_window_never_breaches_error_rate() {
        let config = AlertConfig::default();
        assert!(window_breaches(&config, &window(0, 1.0, 0.0), Utc::now()).is_empty());
    }

    #[test]
    fn test_latency_breach() {
        let config = AlertConfig::default();
        let now = Utc::now();
        let range = TimeRange::last(chrono::Duration::hours(1), now);

        assert!(latency_breach(&config, 4_999.0, range, now).is_none());
        let alert = latency_breach(&config, 6_000.0, range, now).unwrap();
        assert_eq!(alert.payload["threshold"], 5_000.0);

        let disabled = AlertConfig {
            max_p95_latency_ms: None,
            ..AlertConfig::default()
        };
        assert!(latency_breach(&disabled, 1e9, range, now).is_none());
    }

    #[tokio::test]
    async fn test_recording_sink() {
        let sink = RecordingAlertSink::new();
        sink.send(Alert::buffer_overflow("drop_oldest", 10, Utc::now()))
            .await
            .unwrap();
        LoggingAlertSink
            .send(Alert::buffer_overflow("drop_oldest", 10, Utc::now()))
            .await
            .unwrap();

        assert_eq!(sink.count(AlertKind::BufferOverflow), 1);
        assert_eq!(sink.alerts()[0].payload["capacity"], 10);
    }
}
