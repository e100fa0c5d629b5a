//! Analysis report assembled by the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use usage_analytics_types::{
    AnomalyPoint, ForecastPoint, MetricsSummary, Resolution, SeriesMetric, TimeRange,
};

use analyzer::ForecastHorizons;
use processor::{SeriesFilter, TopEntry, WindowMetrics};

/// Metrics every report summarizes
pub const REPORT_METRICS: [SeriesMetric; 5] = [
    SeriesMetric::Latency,
    SeriesMetric::Cost,
    SeriesMetric::Throughput,
    SeriesMetric::ErrorRate,
    SeriesMetric::CacheHitRate,
];

/// Metrics that get forecasts
pub const FORECAST_METRICS: [SeriesMetric; 2] = [SeriesMetric::Cost, SeriesMetric::Throughput];

/// Scope of `analyze_ai_performance`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOptions {
    pub range: TimeRange,
    #[serde(default = "default_resolution")]
    pub resolution: Resolution,
    #[serde(default)]
    pub feature_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_true")]
    pub include_forecast: bool,
}

fn default_resolution() -> Resolution {
    Resolution::FiveMinutes
}

fn default_true() -> bool {
    true
}

impl AnalysisOptions {
    pub fn new(range: TimeRange) -> Self {
        Self {
            range,
            resolution: default_resolution(),
            feature_id: None,
            model: None,
            include_forecast: true,
        }
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_feature(mut self, feature_id: impl Into<String>) -> Self {
        self.feature_id = Some(feature_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn without_forecast(mut self) -> Self {
        self.include_forecast = false;
        self
    }

    /// Filter selecting the events or rollups this report covers
    pub fn filter(&self, metric: SeriesMetric) -> SeriesFilter {
        SeriesFilter {
            metric,
            resolution: self.resolution,
            feature_id: self.feature_id.clone(),
            model: self.model.clone(),
        }
    }

    pub fn cache_key(&self) -> String {
        format!(
            "analysis:{}:{}:{}:{}:{}:{}",
            self.range.start.timestamp_millis(),
            self.range.end.timestamp_millis(),
            self.resolution,
            key_part(self.feature_id.as_deref()),
            key_part(self.model.as_deref()),
            self.include_forecast
        )
    }
}

/// Cache-key segment for an optional id, `*` when absent
///
/// Separators and the wildcard are escaped so distinct ids never share a key.
pub(crate) fn key_part(id: Option<&str>) -> String {
    match id {
        None => "*".to_string(),
        Some(id) => {
            let mut out = String::with_capacity(id.len() + 2);
            out.push('=');
            for c in id.chars() {
                if matches!(c, '\\' | ':' | ',') {
                    out.push('\\');
                }
                out.push(c);
            }
            out
        }
    }
}

/// Summary and anomalies of one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub summary: MetricsSummary,
    pub anomalies: Vec<AnomalyPoint>,
}

/// Forecasts of one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricForecast {
    pub linear: Vec<ForecastPoint>,
    pub horizons: ForecastHorizons,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub range: TimeRange,
    pub resolution: Resolution,
    /// Windows the series were built from
    pub windows: usize,
    pub metrics: BTreeMap<SeriesMetric, MetricReport>,
    pub forecasts: BTreeMap<SeriesMetric, MetricForecast>,
    pub top_features: Vec<TopEntry>,
    pub top_models: Vec<TopEntry>,
    /// Live window containing the generation time
    pub realtime: Option<WindowMetrics>,
    /// Alerts forwarded to the sink while building the report
    pub alerts_raised: usize,
    pub generated_at: DateTime<Utc>,
}

impl AnalysisReport {
    pub fn metric(&self, metric: SeriesMetric) -> Option<&MetricReport> {
        self.metrics.get(&metric)
    }

    pub fn forecast(&self, metric: SeriesMetric) -> Option<&MetricForecast> {
        self.forecasts.get(&metric)
    }
}
