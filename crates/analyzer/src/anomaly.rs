//! Anomaly Detection
//!
//! Two passes over a series, merged:
//!
//! - **Z-score**: each point is scored against the mean and standard
//!   deviation of the *other* points, so a lone outlier cannot inflate the
//!   spread it is measured against. A point that deviates from an otherwise
//!   constant series scores [`Z_SCORE_CAP`]. Scored against the whole
//!   series instead, a single spike in `n` points can never exceed
//!   `sqrt(n - 1)`: `[10 x 9, 100]` lands exactly on 3 and would pass the
//!   default threshold unflagged. `expected` is the leave-one-out mean.
//! - **Moving average**: past a warm-up of `min(10, n/4)` points, a point is
//!   a pattern break when it sits more than twice the series standard
//!   deviation away from the mean of the preceding window.
//!
//! Results are ordered by severity, most severe first, then most recent first.

use serde::{Deserialize, Serialize};
use usage_analytics_config::AnalysisConfig;
use usage_analytics_types::{AnomalyPoint, AnomalySeverity, AnomalyType, TimeSeriesPoint};

use crate::stats;

/// Score given to a deviation from an otherwise constant series
pub const Z_SCORE_CAP: f64 = 10.0;

/// Largest moving-average window
pub const MAX_MOVING_WINDOW: usize = 10;

/// Anomaly detector configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyDetectorConfig {
    /// Z-score a point must exceed to be flagged
    pub z_threshold: f64,
    /// Multiple of the standard deviation a point must stray from its moving average
    pub moving_average_sigmas: f64,
}

impl Default for AnomalyDetectorConfig {
    fn default() -> Self {
        Self {
            z_threshold: 3.0,
            moving_average_sigmas: 2.0,
        }
    }
}

/// Z-score plus moving-average anomaly detector
#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    config: AnomalyDetectorConfig,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyDetectorConfig) -> Self {
        Self { config }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(AnomalyDetectorConfig {
            z_threshold: config.z_score_threshold,
            ..AnomalyDetectorConfig::default()
        })
    }

    /// Run both passes and merge the results
    pub fn detect(&self, points: &[TimeSeriesPoint]) -> Vec<AnomalyPoint> {
        let mut anomalies = self.z_score_pass(points);
        anomalies.extend(self.moving_average_pass(points));
        anomalies.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        anomalies
    }

    /// Severity band for a z-score
    pub fn z_severity(z: f64) -> AnomalySeverity {
        if z > 5.0 {
            AnomalySeverity::Critical
        } else if z > 4.0 {
            AnomalySeverity::High
        } else if z > 3.5 {
            AnomalySeverity::Medium
        } else {
            AnomalySeverity::Low
        }
    }

    /// Global outliers
    pub fn z_score_pass(&self, points: &[TimeSeriesPoint]) -> Vec<AnomalyPoint> {
        let n = points.len();
        if n < 3 {
            return Vec::new();
        }
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        let series_mean = stats::mean(&values);
        if stats::is_negligible(stats::std_dev(&values), series_mean) {
            return Vec::new();
        }

        let mut others = Vec::with_capacity(n - 1);
        let mut anomalies = Vec::new();
        for (i, point) in points.iter().enumerate() {
            others.clear();
            others.extend(values[..i].iter().chain(&values[i + 1..]).copied());
            let mean = stats::mean(&others);
            let sd = stats::std_dev(&others);
            let deviation = (point.value - mean).abs();

            let z = if stats::is_negligible(deviation, mean) {
                0.0
            } else if stats::is_negligible(sd, mean) {
                Z_SCORE_CAP
            } else {
                (deviation / sd).min(Z_SCORE_CAP)
            };

            if z > self.config.z_threshold {
                anomalies.push(AnomalyPoint {
                    timestamp: point.timestamp,
                    value: point.value,
                    expected: mean,
                    severity: Self::z_severity(z),
                    anomaly_type: if point.value > mean {
                        AnomalyType::Spike
                    } else {
                        AnomalyType::Drop
                    },
                    confidence: (z / 5.0).min(1.0),
                });
            }
        }
        anomalies
    }

    /// Local deviations from the trailing moving average
    pub fn moving_average_pass(&self, points: &[TimeSeriesPoint]) -> Vec<AnomalyPoint> {
        let window = MAX_MOVING_WINDOW.min(points.len() / 4);
        if window == 0 {
            return Vec::new();
        }
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        let sd = stats::std_dev(&values);
        if stats::is_negligible(sd, stats::mean(&values)) {
            return Vec::new();
        }
        let threshold = self.config.moving_average_sigmas * sd;

        let mut anomalies = Vec::new();
        for i in window..values.len() {
            let moving_avg = stats::mean(&values[i - window..i]);
            let deviation = (values[i] - moving_avg).abs();
            if deviation > threshold {
                anomalies.push(AnomalyPoint {
                    timestamp: points[i].timestamp,
                    value: values[i],
                    expected: moving_avg,
                    severity: if deviation > 2.0 * threshold {
                        AnomalySeverity::High
                    } else {
                        AnomalySeverity::Medium
                    },
                    anomaly_type: AnomalyType::PatternBreak,
                    confidence: (deviation / (2.0 * threshold)).min(1.0),
                });
            }
        }
        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};

    fn series(values: &[f64]) -> Vec<TimeSeriesPoint> {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| TimeSeriesPoint::new(base + Duration::minutes(i as i64), *v))
            .collect()
    }

    #[test]
    fn test_spike_after_flat_run() {
        let detector = AnomalyDetector::default();
        let points = series(&[10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 100.0]);
        let anomalies = detector.detect(&points);

        let spike = anomalies
            .iter()
            .find(|a| a.anomaly_type == AnomalyType::Spike)
            .expect("spike flagged");
        assert_eq!(spike.timestamp, points[9].timestamp);
        assert!(spike.severity >= AnomalySeverity::High);
        assert_eq!(spike.expected, 10.0);
        assert_eq!(spike.confidence, 1.0);

        // Only the last point is out of line
        assert!(anomalies.iter().all(|a| a.timestamp == points[9].timestamp));
        assert_eq!(anomalies[0].anomaly_type, AnomalyType::Spike);
    }

    #[test]
    fn test_lone_spike_flagged_where_series_wide_score_is_three() {
        let mut values = vec![10.0; 9];
        values.push(100.0);

        let series_wide = (values[9] - stats::mean(&values)) / stats::std_dev(&values);
        assert_relative_eq!(series_wide, 3.0, epsilon = 1e-12);

        let flagged = AnomalyDetector::default().z_score_pass(&series(&values));
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].value, 100.0);
        assert_eq!(flagged[0].expected, 10.0);
    }

    #[test]
    fn test_drop_is_flagged() {
        let detector = AnomalyDetector::default();
        let mut values = vec![50.0; 30];
        for (i, v) in values.iter_mut().enumerate() {
            *v += (i % 3) as f64;
        }
        values[20] = 5.0;

        let anomalies = detector.z_score_pass(&series(&values));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].anomaly_type, AnomalyType::Drop);
        assert_eq!(anomalies[0].severity, AnomalySeverity::Critical);
    }

    #[test]
    fn test_constant_and_short_series_have_no_anomalies() {
        let detector = AnomalyDetector::default();
        assert!(detector.detect(&series(&[7.0; 50])).is_empty());
        assert!(detector.detect(&series(&[0.1; 12])).is_empty());
        assert!(detector.detect(&series(&[1.0, 100.0])).is_empty());
        assert!(detector.detect(&[]).is_empty());
    }

    #[test]
    fn test_pattern_break_severity() {
        let detector = AnomalyDetector::default();
        // Alternating baseline with one local jump
        let mut values: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 10.0 } else { 20.0 }).collect();
        values[30] = 60.0;

        let breaks = detector.moving_average_pass(&series(&values));
        assert!(!breaks.is_empty());
        let at_jump = breaks
            .iter()
            .find(|a| a.timestamp == series(&values)[30].timestamp)
            .expect("jump flagged");
        assert_eq!(at_jump.anomaly_type, AnomalyType::PatternBreak);
        assert!(at_jump.severity == AnomalySeverity::Medium || at_jump.severity == AnomalySeverity::High);
        assert!(at_jump.confidence > 0.0 && at_jump.confidence <= 1.0);
    }

    #[test]
    fn test_ordering_severity_then_recency() {
        let detector = AnomalyDetector::default();
        let mut values: Vec<f64> = (0..60).map(|i| 100.0 + (i % 5) as f64).collect();
        values[10] = 400.0;
        values[50] = 400.0;
        values[30] = 160.0;

        let anomalies = detector.detect(&series(&values));
        for pair in anomalies.windows(2) {
            assert!(pair[0].severity >= pair[1].severity);
            if pair[0].severity == pair[1].severity {
                assert!(pair[0].timestamp >= pair[1].timestamp);
            }
        }
    }

    #[test]
    fn test_z_severity_bands() {
        assert_eq!(AnomalyDetector::z_severity(5.1), AnomalySeverity::Critical);
        assert_eq!(AnomalyDetector::z_severity(4.5), AnomalySeverity::High);
        assert_eq!(AnomalyDetector::z_severity(3.7), AnomalySeverity::Medium);
        assert_eq!(AnomalyDetector::z_severity(3.2), AnomalySeverity::Low);
    }
}
