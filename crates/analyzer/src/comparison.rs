//! Comparator
//!
//! Before/after comparison of metric series between two time ranges using a
//! pooled-variance two-sample t-test.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::debug;
use usage_analytics_types::{
    ComparisonResult, MetricComparison, Resolution, SeriesMetric, TimeRange, TimeSeriesPoint,
};

use processor::{PersistenceGateway, SeriesFilter};

use crate::errors::{AnalysisError, Result};
use crate::stats;

/// What to compare and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonOptions {
    pub metrics: Vec<SeriesMetric>,
    /// Window size of the compared series
    pub resolution: Resolution,
    pub feature_id: Option<String>,
    pub model: Option<String>,
    /// Overrides the configured confidence level
    pub confidence_level: Option<f64>,
}

impl Default for ComparisonOptions {
    fn default() -> Self {
        Self {
            metrics: vec![
                SeriesMetric::Latency,
                SeriesMetric::Cost,
                SeriesMetric::Throughput,
                SeriesMetric::ErrorRate,
                SeriesMetric::CacheHitRate,
            ],
            resolution: Resolution::FiveMinutes,
            feature_id: None,
            model: None,
            confidence_level: None,
        }
    }
}

impl ComparisonOptions {
    /// Gateway filter for one metric
    pub fn filter(&self, metric: SeriesMetric) -> SeriesFilter {
        SeriesFilter {
            metric,
            resolution: self.resolution,
            feature_id: self.feature_id.clone(),
            model: self.model.clone(),
        }
    }
}

/// Outcome of a two-sample t-test
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TTest {
    /// `(mean_b - mean_a) / se`
    pub t: f64,
    pub degrees_of_freedom: f64,
    /// Two-tailed
    pub p_value: f64,
}

/// Pooled-variance two-sample t-test
///
/// With fewer than two samples on either side there is no evidence of a
/// difference and `p = 1`. A zero standard error gives `p = 1` for equal
/// means and `p = 0` otherwise.
pub fn two_sample_t_test(a: &[f64], b: &[f64]) -> Result<TTest> {
    let (na, nb) = (a.len(), b.len());
    if na < 2 || nb < 2 {
        return Ok(TTest {
            t: 0.0,
            degrees_of_freedom: 0.0,
            p_value: 1.0,
        });
    }

    let (mean_a, mean_b) = (stats::mean(a), stats::mean(b));
    let df = (na + nb - 2) as f64;
    let pooled = ((na - 1) as f64 * stats::sample_variance(a)
        + (nb - 1) as f64 * stats::sample_variance(b))
        / df;
    let se = (pooled * (1.0 / na as f64 + 1.0 / nb as f64)).sqrt();
    let diff = mean_b - mean_a;

    if stats::is_negligible(se, mean_a.abs().max(mean_b.abs())) {
        let p_value = if stats::is_negligible(diff.abs(), mean_a) { 1.0 } else { 0.0 };
        return Ok(TTest {
            t: 0.0,
            degrees_of_freedom: df,
            p_value,
        });
    }

    let t = diff / se;
    let dist = StudentsT::new(0.0, 1.0, df)
        .map_err(|e| AnalysisError::StatisticalError(e.to_string()))?;
    let p_value = (2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0);

    Ok(TTest {
        t,
        degrees_of_freedom: df,
        p_value,
    })
}

/// Relative change in percent, `None` when the baseline is zero
pub fn percent_change(baseline: f64, comparison: f64) -> Option<f64> {
    if baseline == 0.0 {
        return None;
    }
    Some((comparison - baseline) / baseline * 100.0)
}

/// Two-range metric comparator
#[derive(Debug, Clone)]
pub struct Comparator {
    confidence_level: f64,
}

impl Default for Comparator {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
        }
    }
}

impl Comparator {
    pub fn new(confidence_level: f64) -> Result<Self> {
        if !(confidence_level > 0.0 && confidence_level < 1.0) {
            return Err(AnalysisError::InvalidParameter(format!(
                "confidence level must be in (0, 1), got {}",
                confidence_level
            )));
        }
        Ok(Self { confidence_level })
    }

    pub fn confidence_level(&self) -> f64 {
        self.confidence_level
    }

    /// Compare one metric's baseline and comparison samples
    pub fn compare_values(
        &self,
        metric: SeriesMetric,
        baseline: &[f64],
        comparison: &[f64],
    ) -> Result<MetricComparison> {
        let baseline_value = stats::mean(baseline);
        let comparison_value = stats::mean(comparison);
        let test = two_sample_t_test(baseline, comparison)?;

        let improved = if metric.higher_is_better() {
            comparison_value > baseline_value
        } else {
            comparison_value < baseline_value
        };

        Ok(MetricComparison {
            metric,
            baseline_value,
            comparison_value,
            percent_change: percent_change(baseline_value, comparison_value),
            p_value: test.p_value,
            significant: test.p_value < 1.0 - self.confidence_level,
            improved,
            baseline_samples: baseline.len(),
            comparison_samples: comparison.len(),
        })
    }

    /// Compare prepared series, one `(metric, baseline, comparison)` triple per metric
    pub fn compare_series(
        &self,
        baseline: TimeRange,
        comparison: TimeRange,
        series: &[(SeriesMetric, Vec<TimeSeriesPoint>, Vec<TimeSeriesPoint>)],
    ) -> Result<ComparisonResult> {
        let metrics = series
            .iter()
            .map(|(metric, base, cmp)| {
                let base: Vec<f64> = base.iter().map(|p| p.value).collect();
                let cmp: Vec<f64> = cmp.iter().map(|p| p.value).collect();
                self.compare_values(*metric, &base, &cmp)
            })
            .collect::<Result<Vec<_>>>()?;

        let significant = metrics.iter().filter(|m| m.significant).count();
        let improvements = metrics.iter().filter(|m| m.significant && m.improved).count();
        let overall_improvement_score = if significant == 0 {
            0.0
        } else {
            improvements as f64 / significant as f64
        };

        Ok(ComparisonResult {
            baseline,
            comparison,
            confidence_level: self.confidence_level,
            metrics,
            overall_improvement_score,
        })
    }

    /// Fetch both ranges from the gateway and compare them
    pub async fn compare_ranges(
        &self,
        gateway: &dyn PersistenceGateway,
        baseline: TimeRange,
        comparison: TimeRange,
        options: &ComparisonOptions,
    ) -> Result<ComparisonResult> {
        let comparator = match options.confidence_level {
            Some(level) => Comparator::new(level)?,
            None => self.clone(),
        };

        let mut series = Vec::with_capacity(options.metrics.len());
        for &metric in &options.metrics {
            let filter = options.filter(metric);
            let base = gateway.query_series(&filter, baseline).await?;
            let cmp = gateway.query_series(&filter, comparison).await?;
            debug!(
                %metric,
                baseline_points = base.len(),
                comparison_points = cmp.len(),
                "Fetched comparison series"
            );
            series.push((metric, base, cmp));
        }

        comparator.compare_series(baseline, comparison, &series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_t_test_detects_shift() {
        let a: Vec<f64> = (0..30).map(|i| 100.0 + (i % 5) as f64).collect();
        let b: Vec<f64> = (0..30).map(|i| 120.0 + (i % 5) as f64).collect();
        let test = two_sample_t_test(&a, &b).unwrap();

        assert!(test.t > 0.0);
        assert_eq!(test.degrees_of_freedom, 58.0);
        assert!(test.p_value < 1e-6);
    }

    #[test]
    fn test_t_test_no_difference() {
        let a = [10.0, 12.0, 11.0, 13.0, 9.0];
        let test = two_sample_t_test(&a, &a).unwrap();
        assert_relative_eq!(test.p_value, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_t_test_known_value() {
        // Pooled variance 2.5, se = 1.0, t = 3 with 8 degrees of freedom
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [4.0, 5.0, 6.0, 7.0, 8.0];
        let test = two_sample_t_test(&a, &b).unwrap();
        assert_relative_eq!(test.t, 3.0, epsilon = 1e-12);
        assert_relative_eq!(test.p_value, 0.017065, epsilon = 1e-4);
    }

    #[test]
    fn test_t_test_degenerate_inputs() {
        assert_eq!(two_sample_t_test(&[1.0], &[5.0, 6.0]).unwrap().p_value, 1.0);
        assert_eq!(two_sample_t_test(&[], &[]).unwrap().p_value, 1.0);
        assert_eq!(two_sample_t_test(&[3.0; 4], &[3.0; 6]).unwrap().p_value, 1.0);
        assert_eq!(two_sample_t_test(&[3.0; 4], &[4.0; 6]).unwrap().p_value, 0.0);
    }

    #[test]
    fn test_percent_change_guard() {
        assert_eq!(percent_change(0.0, 5.0), None);
        assert_relative_eq!(percent_change(50.0, 75.0).unwrap(), 50.0);
        assert_relative_eq!(percent_change(50.0, 25.0).unwrap(), -50.0);
    }

    #[test]
    fn test_swap_negates_change_and_keeps_significance() {
        let comparator = Comparator::default();
        let before: Vec<f64> = (0..20).map(|i| 200.0 + (i % 7) as f64 * 3.0).collect();
        let after: Vec<f64> = (0..20).map(|i| 150.0 + (i % 4) as f64 * 5.0).collect();

        let forward = comparator
            .compare_values(SeriesMetric::Latency, &before, &after)
            .unwrap();
        let backward = comparator
            .compare_values(SeriesMetric::Latency, &after, &before)
            .unwrap();

        let f = forward.percent_change.unwrap();
        let b = backward.percent_change.unwrap();
        assert!(f < 0.0 && b > 0.0);
        assert_relative_eq!(forward.p_value, backward.p_value, epsilon = 1e-12);
        assert_eq!(forward.significant, backward.significant);
        assert!(forward.improved);
        assert!(!backward.improved);
    }

    #[test]
    fn test_improvement_direction_per_metric() {
        let comparator = Comparator::default();
        let low: Vec<f64> = (0..10).map(|i| 10.0 + (i % 2) as f64).collect();
        let high: Vec<f64> = (0..10).map(|i| 20.0 + (i % 2) as f64).collect();

        let throughput = comparator
            .compare_values(SeriesMetric::Throughput, &low, &high)
            .unwrap();
        let errors = comparator
            .compare_values(SeriesMetric::ErrorRate, &low, &high)
            .unwrap();
        let accuracy = comparator
            .compare_values(SeriesMetric::Accuracy, &low, &high)
            .unwrap();

        assert!(throughput.significant && throughput.improved);
        assert!(errors.significant && !errors.improved);
        assert!(accuracy.improved);
    }

    #[test]
    fn test_overall_improvement_score() {
        use chrono::{Duration, TimeZone, Utc};

        let comparator = Comparator::default();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let points = |values: Vec<f64>| -> Vec<TimeSeriesPoint> {
            values
                .into_iter()
                .enumerate()
                .map(|(i, v)| TimeSeriesPoint::new(base + Duration::minutes(i as i64), v))
                .collect()
        };
        let low: Vec<f64> = (0..10).map(|i| 10.0 + (i % 3) as f64).collect();
        let high: Vec<f64> = (0..10).map(|i| 30.0 + (i % 3) as f64).collect();

        let range_a = TimeRange::new(base, base + Duration::hours(1));
        let range_b = TimeRange::new(base + Duration::hours(1), base + Duration::hours(2));
        let result = comparator
            .compare_series(
                range_a,
                range_b,
                &[
                    (SeriesMetric::Latency, points(high.clone()), points(low.clone())),
                    (SeriesMetric::Cost, points(low.clone()), points(high.clone())),
                    (SeriesMetric::Throughput, points(low.clone()), points(high.clone())),
                    (SeriesMetric::Tokens, points(low.clone()), points(low.clone())),
                ],
            )
            .unwrap();

        assert_eq!(result.metrics.len(), 4);
        assert!(!result.metric(SeriesMetric::Tokens).unwrap().significant);
        // latency and throughput improved, cost regressed
        assert_relative_eq!(result.overall_improvement_score, 2.0 / 3.0);

        let quiet = comparator
            .compare_series(range_a, range_b, &[(SeriesMetric::Cost, points(low.clone()), points(low))])
            .unwrap();
        assert_eq!(quiet.overall_improvement_score, 0.0);
    }
}
