//! Statistical primitives shared by the analyzers
//!
//! Population moments, interpolated percentiles, least-squares fits and
//! autocorrelation. Every function is total: degenerate input yields a
//! neutral value instead of NaN or infinity.

/// Values whose spread is below this fraction of their magnitude are treated as constant
const RELATIVE_EPSILON: f64 = 1e-12;

/// Arithmetic mean, `0.0` for an empty slice
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance, `0.0` for fewer than two values
pub fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

/// Sample (n - 1) variance, `0.0` for fewer than two values
pub fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

/// Whether a spread is indistinguishable from zero at the scale of `reference`
pub fn is_negligible(spread: f64, reference: f64) -> bool {
    spread <= RELATIVE_EPSILON * reference.abs().max(1.0)
}

/// Percentile of an ascending slice with linear interpolation between ranks
///
/// `rank = p / 100 * (n - 1)`; the value is interpolated between the floor
/// and ceiling ranks. Returns `0.0` for an empty slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let p = p.clamp(0.0, 100.0);
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        sorted[lower]
    } else {
        let weight = rank - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * weight
    }
}

/// Ordinary least-squares fit of value against sequence index
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    /// Number of points fitted
    pub n: usize,
    /// Mean of the indices
    pub x_mean: f64,
    /// Sum of squared index deviations
    pub sxx: f64,
    /// Residual standard error, `0.0` with two or fewer points
    pub residual_std: f64,
}

impl LinearFit {
    /// Fit `values[i]` against `i`
    ///
    /// With fewer than two points the fit is flat through the mean.
    pub fn fit(values: &[f64]) -> Self {
        let n = values.len();
        let y_mean = mean(values);
        if n < 2 {
            return Self {
                slope: 0.0,
                intercept: y_mean,
                n,
                x_mean: 0.0,
                sxx: 0.0,
                residual_std: 0.0,
            };
        }

        let x_mean = (n - 1) as f64 / 2.0;
        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for (i, y) in values.iter().enumerate() {
            let dx = i as f64 - x_mean;
            sxx += dx * dx;
            sxy += dx * (y - y_mean);
        }

        let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
        let intercept = y_mean - slope * x_mean;

        let residual_std = if n > 2 {
            let sse: f64 = values
                .iter()
                .enumerate()
                .map(|(i, y)| (y - (intercept + slope * i as f64)).powi(2))
                .sum();
            (sse / (n - 2) as f64).sqrt()
        } else {
            0.0
        };

        Self {
            slope,
            intercept,
            n,
            x_mean,
            sxx,
            residual_std,
        }
    }

    /// Fitted value at index `x`
    pub fn predict(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }

    /// Standard error of a new observation at index `x`
    pub fn prediction_std_error(&self, x: f64) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let leverage = if self.sxx > 0.0 {
            (x - self.x_mean).powi(2) / self.sxx
        } else {
            0.0
        };
        self.residual_std * (1.0 + 1.0 / self.n as f64 + leverage).sqrt()
    }
}

/// Autocorrelation at `lag`
///
/// `r = Σ(x_i - m)(x_{i+lag} - m) / Σ(x_i - m)²`; `0.0` when the series has
/// no variance or the lag leaves no pairs.
pub fn autocorrelation(values: &[f64], lag: usize) -> f64 {
    let n = values.len();
    if lag == 0 || lag >= n {
        return 0.0;
    }
    let m = mean(values);
    let denominator: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    if is_negligible(denominator, m * m * n as f64) {
        return 0.0;
    }

    let numerator: f64 = (0..n - lag)
        .map(|i| (values[i] - m) * (values[i + lag] - m))
        .sum();
    numerator / denominator
}

/// Median of unsorted values
pub fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile(&sorted, 50.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_moments() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_relative_eq!(mean(&values), 5.0);
        assert_relative_eq!(std_dev(&values), 2.0);
        assert_relative_eq!(sample_variance(&values), 32.0 / 7.0);
        assert_eq!(std_dev(&[]), 0.0);
        assert_eq!(std_dev(&[3.0]), 0.0);
    }

    #[test]
    fn test_percentile_interpolation() {
        let sorted: Vec<f64> = (1..=5).map(|v| v as f64 * 10.0).collect();
        assert_relative_eq!(percentile(&sorted, 50.0), 30.0);
        // rank 0.95 * 4 = 3.8 -> 40 + 0.8 * 10
        assert_relative_eq!(percentile(&sorted, 95.0), 48.0);
        assert_relative_eq!(percentile(&sorted, 100.0), 50.0);
        assert_relative_eq!(percentile(&sorted, 0.0), 10.0);
        assert_eq!(percentile(&[], 99.0), 0.0);
        assert_relative_eq!(median(&[9.0, 1.0, 5.0, 3.0]), 4.0);
    }

    #[test]
    fn test_linear_fit() {
        let values: Vec<f64> = (0..10).map(|i| 3.0 + 2.0 * i as f64).collect();
        let fit = LinearFit::fit(&values);
        assert_relative_eq!(fit.slope, 2.0, epsilon = 1e-12);
        assert_relative_eq!(fit.intercept, 3.0, epsilon = 1e-12);
        assert_relative_eq!(fit.residual_std, 0.0, epsilon = 1e-9);
        assert_relative_eq!(fit.predict(10.0), 23.0, epsilon = 1e-9);

        let flat = LinearFit::fit(&[4.0]);
        assert_eq!(flat.slope, 0.0);
        assert_eq!(flat.intercept, 4.0);
    }

    #[test]
    fn test_prediction_error_grows_with_distance() {
        let values = [1.0, 3.0, 2.0, 5.0, 4.0, 6.0, 5.0, 8.0];
        let fit = LinearFit::fit(&values);
        let near = fit.prediction_std_error(8.0);
        let far = fit.prediction_std_error(20.0);
        assert!(fit.residual_std > 0.0);
        assert!(far > near);
    }

    #[test]
    fn test_autocorrelation() {
        let periodic: Vec<f64> = (0..40).map(|i| if i % 4 < 2 { 1.0 } else { -1.0 }).collect();
        assert!(autocorrelation(&periodic, 4) > 0.8);
        assert!(autocorrelation(&periodic, 2) < -0.8);
        assert_eq!(autocorrelation(&[5.0; 30], 3), 0.0);
        assert_eq!(autocorrelation(&periodic, 0), 0.0);
        assert_eq!(autocorrelation(&periodic, 40), 0.0);
    }
}
