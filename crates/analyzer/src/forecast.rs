//! Forecaster
//!
//! Short-horizon statistical projections: a linear OLS forecast at the
//! series' own sampling interval, and an exponentially smoothed trend
//! projected over fixed hour/day/week horizons with damping. Every point
//! carries a prediction interval and is clamped at zero.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use usage_analytics_config::AnalysisConfig;
use usage_analytics_types::{ForecastPoint, TimeSeriesPoint};

use crate::errors::{AnalysisError, Result};
use crate::stats::{self, LinearFit};

/// Smoothing factor of the trend estimate
pub const SMOOTHING_ALPHA: f64 = 0.3;

/// Step count, step length and trend damping of one smoothing horizon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Horizon {
    pub steps: usize,
    pub step_secs: i64,
    pub damping: f64,
}

impl Horizon {
    pub fn step(&self) -> Duration {
        Duration::seconds(self.step_secs)
    }
}

pub const NEXT_HOUR: Horizon = Horizon {
    steps: 12,
    step_secs: 5 * 60,
    damping: 1.0,
};

pub const NEXT_DAY: Horizon = Horizon {
    steps: 24,
    step_secs: 60 * 60,
    damping: 0.8,
};

pub const NEXT_WEEK: Horizon = Horizon {
    steps: 7,
    step_secs: 24 * 60 * 60,
    damping: 0.5,
};

/// Projections from the smoothed trend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForecastHorizons {
    /// Final smoothed per-step trend
    pub trend: f64,
    pub next_hour: Vec<ForecastPoint>,
    pub next_day: Vec<ForecastPoint>,
    pub next_week: Vec<ForecastPoint>,
}

/// Median of the positive gaps between consecutive timestamps
///
/// Falls back to `default` with fewer than two points or no positive gap.
pub fn infer_interval(points: &[TimeSeriesPoint], default: Duration) -> Duration {
    if points.len() < 2 {
        return default;
    }
    let gaps: Vec<f64> = points
        .windows(2)
        .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds() as f64)
        .filter(|gap| *gap > 0.0)
        .collect();
    if gaps.is_empty() {
        return default;
    }
    Duration::milliseconds(stats::median(&gaps).round() as i64)
}

/// Linear and smoothed-trend forecaster
#[derive(Debug, Clone)]
pub struct Forecaster {
    steps: usize,
    default_interval: Duration,
    /// Two-sided normal quantile for the prediction interval
    z: f64,
}

impl Forecaster {
    pub fn new(steps: usize, default_interval: Duration, confidence_level: f64) -> Result<Self> {
        if !(confidence_level > 0.0 && confidence_level < 1.0) {
            return Err(AnalysisError::InvalidParameter(format!(
                "confidence level must be in (0, 1), got {}",
                confidence_level
            )));
        }
        let normal = Normal::new(0.0, 1.0)
            .map_err(|e| AnalysisError::StatisticalError(e.to_string()))?;
        let z = normal.inverse_cdf(0.5 + confidence_level / 2.0);

        Ok(Self {
            steps,
            default_interval,
            z,
        })
    }

    pub fn from_config(config: &AnalysisConfig) -> Result<Self> {
        Self::new(
            config.forecast_steps,
            Duration::seconds(config.default_interval_secs as i64),
            config.confidence_level,
        )
    }

    /// Project the OLS fit `steps` intervals past the last point
    pub fn linear(&self, points: &[TimeSeriesPoint]) -> Vec<ForecastPoint> {
        let Some(last) = points.last() else {
            return Vec::new();
        };

        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        let fit = LinearFit::fit(&values);
        let interval = infer_interval(points, self.default_interval);
        let last_index = (values.len() - 1) as f64;

        (1..=self.steps)
            .map(|k| {
                let x = last_index + k as f64;
                let value = fit.predict(x);
                let margin = self.z * fit.prediction_std_error(x);
                ForecastPoint::new(
                    last.timestamp + interval * k as i32,
                    value,
                    value - margin,
                    value + margin,
                )
            })
            .collect()
    }

    /// Smoothed trend, seeded from the first delta
    ///
    /// `trend_t = α(v_t − v_{t−1}) + (1 − α)trend_{t−1}`. Zero with fewer
    /// than two values.
    pub fn smoothed_trend(values: &[f64]) -> f64 {
        let mut deltas = values.windows(2).map(|w| w[1] - w[0]);
        let Some(first) = deltas.next() else {
            return 0.0;
        };
        deltas.fold(first, |trend, delta| {
            SMOOTHING_ALPHA * delta + (1.0 - SMOOTHING_ALPHA) * trend
        })
    }

    /// Project the smoothed trend over the hour, day and week horizons
    pub fn horizons(&self, points: &[TimeSeriesPoint]) -> ForecastHorizons {
        let Some(last) = points.last() else {
            return ForecastHorizons::default();
        };

        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        let trend = Self::smoothed_trend(&values);
        let deltas: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
        let spread = stats::std_dev(&deltas);

        let project = |horizon: Horizon| -> Vec<ForecastPoint> {
            self.project(last.timestamp, last.value, trend, spread, horizon)
        };

        ForecastHorizons {
            trend,
            next_hour: project(NEXT_HOUR),
            next_day: project(NEXT_DAY),
            next_week: project(NEXT_WEEK),
        }
    }

    fn project(
        &self,
        from: DateTime<Utc>,
        last: f64,
        trend: f64,
        spread: f64,
        horizon: Horizon,
    ) -> Vec<ForecastPoint> {
        (1..=horizon.steps)
            .map(|k| {
                let value = last + trend * horizon.damping * k as f64;
                let margin = self.z * spread * (k as f64).sqrt();
                ForecastPoint::new(
                    from + horizon.step() * k as i32,
                    value,
                    value - margin,
                    value + margin,
                )
            })
            .collect()
    }
}

impl Default for Forecaster {
    fn default() -> Self {
        Self {
            steps: 12,
            default_interval: Duration::minutes(5),
            z: 1.959_963_984_540_054,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn series(values: &[f64], every: Duration) -> Vec<TimeSeriesPoint> {
        let base = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| TimeSeriesPoint::new(base + every * i as i32, *v))
            .collect()
    }

    #[test]
    fn test_infer_interval() {
        let points = series(&[1.0, 2.0, 3.0, 4.0], Duration::minutes(1));
        assert_eq!(infer_interval(&points, Duration::hours(1)), Duration::minutes(1));
        assert_eq!(infer_interval(&points[..1], Duration::hours(1)), Duration::hours(1));
        assert_eq!(infer_interval(&[], Duration::hours(1)), Duration::hours(1));
    }

    #[test]
    fn test_linear_forecast_extends_line() {
        let forecaster = Forecaster::new(3, Duration::minutes(5), 0.95).unwrap();
        let points = series(&[10.0, 12.0, 14.0, 16.0, 18.0], Duration::minutes(1));
        let forecast = forecaster.linear(&points);

        assert_eq!(forecast.len(), 3);
        assert_relative_eq!(forecast[0].value, 20.0, epsilon = 1e-9);
        assert_relative_eq!(forecast[2].value, 24.0, epsilon = 1e-9);
        assert_eq!(forecast[0].timestamp, points[4].timestamp + Duration::minutes(1));
        assert!(forecast.iter().all(|p| p.lower <= p.value && p.value <= p.upper));
    }

    #[test]
    fn test_interval_widens_with_noise() {
        let forecaster = Forecaster::default();
        let noisy = series(&[10.0, 14.0, 9.0, 15.0, 11.0, 16.0, 12.0], Duration::minutes(5));
        let forecast = forecaster.linear(&noisy);

        let first_width = forecast[0].upper - forecast[0].lower;
        let last_width = forecast[11].upper - forecast[11].lower;
        assert!(first_width > 0.0);
        assert!(last_width > first_width);
    }

    #[test]
    fn test_forecasts_never_negative() {
        let forecaster = Forecaster::default();
        let inputs = [
            vec![1000.0, 800.0, 500.0, 200.0, 50.0],
            vec![5.0, 1.0],
            vec![0.0, 0.0, 0.0],
            vec![3.0],
            vec![100.0, -50.0, 20.0, -80.0],
        ];

        for values in &inputs {
            let points = series(values, Duration::minutes(5));
            let horizons = forecaster.horizons(&points);
            let all = forecaster
                .linear(&points)
                .into_iter()
                .chain(horizons.next_hour)
                .chain(horizons.next_day)
                .chain(horizons.next_week);
            for point in all {
                assert!(point.value >= 0.0, "{:?} -> {:?}", values, point);
                assert!(point.lower >= 0.0 && point.lower <= point.value);
            }
        }
    }

    #[test]
    fn test_smoothed_trend() {
        assert_eq!(Forecaster::smoothed_trend(&[]), 0.0);
        assert_eq!(Forecaster::smoothed_trend(&[4.0]), 0.0);
        assert_relative_eq!(Forecaster::smoothed_trend(&[1.0, 3.0]), 2.0);
        // seed 2, then 0.3 * 4 + 0.7 * 2
        assert_relative_eq!(Forecaster::smoothed_trend(&[1.0, 3.0, 7.0]), 2.6, epsilon = 1e-9);
    }

    #[test]
    fn test_horizon_shapes_and_damping() {
        let forecaster = Forecaster::default();
        let points = series(&[10.0, 11.0, 12.0, 13.0], Duration::minutes(5));
        let horizons = forecaster.horizons(&points);

        assert_eq!(horizons.next_hour.len(), 12);
        assert_eq!(horizons.next_day.len(), 24);
        assert_eq!(horizons.next_week.len(), 7);
        assert_relative_eq!(horizons.trend, 1.0, epsilon = 1e-9);

        let last = points[3].timestamp;
        assert_eq!(horizons.next_hour[11].timestamp, last + Duration::hours(1));
        assert_eq!(horizons.next_day[23].timestamp, last + Duration::days(1));
        assert_eq!(horizons.next_week[6].timestamp, last + Duration::weeks(1));

        assert_relative_eq!(horizons.next_hour[0].value, 14.0, epsilon = 1e-9);
        assert_relative_eq!(horizons.next_day[0].value, 13.8, epsilon = 1e-9);
        assert_relative_eq!(horizons.next_week[1].value, 14.0, epsilon = 1e-9);
    }

    #[test]
    fn test_invalid_confidence() {
        assert!(Forecaster::new(12, Duration::minutes(5), 1.0).is_err());
        assert!(Forecaster::new(12, Duration::minutes(5), 0.0).is_err());
    }
}
