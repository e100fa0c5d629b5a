//! Metrics calculator
//!
//! Descriptive statistics, OLS trend and autocorrelation seasonality over an
//! arbitrary numeric series.

use chrono::Duration;
use usage_analytics_config::AnalysisConfig;
use usage_analytics_types::{MetricsSummary, Seasonality, TimeSeriesPoint, Trend};

use crate::forecast::infer_interval;
use crate::stats::{self, LinearFit};

/// Fewest points for which seasonality is attempted
pub const MIN_SEASONALITY_POINTS: usize = 20;

/// Computes summaries, trends and seasonality
#[derive(Debug, Clone)]
pub struct MetricsCalculator {
    trend_threshold: f64,
    seasonality_threshold: f64,
    default_interval: Duration,
}

impl Default for MetricsCalculator {
    fn default() -> Self {
        Self {
            trend_threshold: 0.05,
            seasonality_threshold: 0.5,
            default_interval: Duration::minutes(5),
        }
    }
}

impl MetricsCalculator {
    pub fn new(trend_threshold: f64, seasonality_threshold: f64, default_interval: Duration) -> Self {
        Self {
            trend_threshold,
            seasonality_threshold,
            default_interval,
        }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(
            config.trend_threshold,
            config.seasonality_threshold,
            Duration::seconds(config.default_interval_secs as i64),
        )
    }

    /// Descriptive statistics plus trend; seasonality is left unset
    ///
    /// An empty series yields all zeros and a stable trend.
    pub fn compute_metrics(&self, values: &[f64]) -> MetricsSummary {
        if values.is_empty() {
            return MetricsSummary::empty();
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        MetricsSummary {
            count: values.len(),
            mean: stats::mean(values),
            median: stats::percentile(&sorted, 50.0),
            std_dev: stats::std_dev(values),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p95: stats::percentile(&sorted, 95.0),
            p99: stats::percentile(&sorted, 99.0),
            trend: self.detect_trend(values),
            seasonality: None,
        }
    }

    /// Sign of the OLS slope against sequence index, with a dead band
    pub fn detect_trend(&self, values: &[f64]) -> Trend {
        let slope = LinearFit::fit(values).slope;
        if slope > self.trend_threshold {
            Trend::Increasing
        } else if slope < -self.trend_threshold {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }

    /// Strongest autocorrelation over lags `1..=n/4`
    ///
    /// Requires at least [`MIN_SEASONALITY_POINTS`] values. The period is the
    /// winning lag times `interval`; amplitude and confidence are the
    /// correlation itself.
    pub fn detect_seasonality(&self, values: &[f64], interval: Duration) -> Seasonality {
        if values.len() < MIN_SEASONALITY_POINTS {
            return Seasonality::not_detected();
        }

        let max_lag = values.len() / 4;
        let mut best_lag = 0;
        let mut best = f64::NEG_INFINITY;
        for lag in 1..=max_lag {
            let r = stats::autocorrelation(values, lag);
            if r > best {
                best = r;
                best_lag = lag;
            }
        }

        if best_lag == 0 || best <= self.seasonality_threshold {
            return Seasonality::not_detected();
        }

        let correlation = best.clamp(0.0, 1.0);
        Seasonality {
            detected: true,
            lag: best_lag,
            period_secs: best_lag as f64 * interval.num_milliseconds() as f64 / 1000.0,
            amplitude: correlation,
            confidence: correlation,
        }
    }

    /// Full summary of a time series, including seasonality at its inferred interval
    pub fn summarize(&self, points: &[TimeSeriesPoint]) -> MetricsSummary {
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        let mut summary = self.compute_metrics(&values);
        let interval = infer_interval(points, self.default_interval);
        summary.seasonality = Some(self.detect_seasonality(&values, interval));
        summary
    }
}
