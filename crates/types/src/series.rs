//! Time-series points and the metrics they can be derived for

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Atomic unit consumed by every analysis component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl TimeSeriesPoint {
    /// Create a point without metadata
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value,
            metadata: None,
        }
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Extract the raw values of a series, preserving order
pub fn values(points: &[TimeSeriesPoint]) -> Vec<f64> {
    points.iter().map(|p| p.value).collect()
}

/// Metric a series can be built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesMetric {
    /// Mean latency in milliseconds
    Latency,
    /// Total cost in USD
    Cost,
    /// Request count per window
    Throughput,
    /// Fraction of failed events
    ErrorRate,
    /// Fraction of successful events
    Accuracy,
    /// Fraction of model requests served from cache
    CacheHitRate,
    /// Tokens consumed
    Tokens,
}

impl SeriesMetric {
    /// Whether a larger value is an improvement for this metric
    pub fn higher_is_better(&self) -> bool {
        matches!(self, Self::Throughput | Self::Accuracy | Self::CacheHitRate)
    }

    /// Stable name used in reports and cache keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Latency => "latency",
            Self::Cost => "cost",
            Self::Throughput => "throughput",
            Self::ErrorRate => "error_rate",
            Self::Accuracy => "accuracy",
            Self::CacheHitRate => "cache_hit_rate",
            Self::Tokens => "tokens",
        }
    }
}

impl fmt::Display for SeriesMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_point_metadata() {
        let point = TimeSeriesPoint::new(Utc.timestamp_opt(0, 0).unwrap(), 1.5)
            .with_metadata("window", "1m")
            .with_metadata("model", "m1");

        assert_eq!(point.metadata.as_ref().map(|m| m.len()), Some(2));
        assert_eq!(values(&[point]), vec![1.5]);
    }

    #[test]
    fn test_improvement_direction() {
        assert!(SeriesMetric::Throughput.higher_is_better());
        assert!(SeriesMetric::Accuracy.higher_is_better());
        assert!(!SeriesMetric::Latency.higher_is_better());
        assert!(!SeriesMetric::ErrorRate.higher_is_better());
        assert!(!SeriesMetric::Cost.higher_is_better());
    }
}
