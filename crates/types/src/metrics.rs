//! Analysis result types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::resolution::TimeRange;
use crate::series::SeriesMetric;

/// Direction of a series over its sequence index
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    #[default]
    Stable,
}

/// Result of autocorrelation-based seasonality detection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Seasonality {
    pub detected: bool,
    /// Best lag in samples
    pub lag: usize,
    /// Period in seconds (lag × sampling interval)
    pub period_secs: f64,
    pub amplitude: f64,
    pub confidence: f64,
}

impl Seasonality {
    /// Neutral result for series that are too short or flat
    pub fn not_detected() -> Self {
        Self::default()
    }
}

/// Descriptive statistics of a series
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MetricsSummary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub p99: f64,
    pub trend: Trend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seasonality: Option<Seasonality>,
}

impl MetricsSummary {
    /// All-zero summary with a stable trend
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Anomaly severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AnomalySeverity {
    /// Whether this anomaly should be forwarded to the alert sink
    pub fn is_alertable(&self) -> bool {
        *self >= Self::High
    }
}

impl fmt::Display for AnomalySeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// How a point deviates from the series
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    /// Global outlier above the mean
    Spike,
    /// Global outlier below the mean
    Drop,
    /// Local deviation from the moving average
    PatternBreak,
}

/// A flagged point
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub expected: f64,
    pub severity: AnomalySeverity,
    pub anomaly_type: AnomalyType,
    /// In `[0, 1]`
    pub confidence: f64,
}

/// A projected value with its prediction interval
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    /// Never negative
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
}

impl ForecastPoint {
    /// Build a point, clamping the prediction and its lower bound at zero
    pub fn new(timestamp: DateTime<Utc>, value: f64, lower: f64, upper: f64) -> Self {
        let value = value.max(0.0);
        Self {
            timestamp,
            value,
            lower: lower.max(0.0).min(value),
            upper: upper.max(value),
        }
    }
}

/// Comparison of one metric between two ranges
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricComparison {
    pub metric: SeriesMetric,
    pub baseline_value: f64,
    pub comparison_value: f64,
    /// `None` when the baseline mean is zero
    pub percent_change: Option<f64>,
    pub p_value: f64,
    pub significant: bool,
    /// Whether the change moved the metric in its favourable direction
    pub improved: bool,
    pub baseline_samples: usize,
    pub comparison_samples: usize,
}

/// Before/after comparison across metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonResult {
    pub baseline: TimeRange,
    pub comparison: TimeRange,
    pub confidence_level: f64,
    pub metrics: Vec<MetricComparison>,
    /// Fraction of significant changes that are improvements, `0.0` when none are significant
    pub overall_improvement_score: f64,
}

impl ComparisonResult {
    /// Comparison for a single metric, if present
    pub fn metric(&self, metric: SeriesMetric) -> Option<&MetricComparison> {
        self.metrics.iter().find(|m| m.metric == metric)
    }
}
