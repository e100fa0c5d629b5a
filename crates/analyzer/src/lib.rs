//! Statistical analysis engine for usage analytics
//!
//! This crate turns metric series into insight: descriptive summaries with
//! trend and seasonality detection, anomaly detection, forecasts over
//! several horizons and before/after comparisons with significance tests.
//! Every analysis is a pure function of its input series except
//! [`Comparator::compare_ranges`], which reads the series from a
//! [`processor::PersistenceGateway`].

pub mod anomaly;
pub mod comparison;
pub mod errors;
pub mod forecast;
pub mod metrics;
pub mod stats;

pub use anomaly::{AnomalyDetector, AnomalyDetectorConfig};
pub use comparison::{two_sample_t_test, Comparator, ComparisonOptions, TTest};
pub use errors::{AnalysisError, Result};
pub use forecast::{infer_interval, ForecastHorizons, Forecaster, Horizon};
pub use metrics::MetricsCalculator;
