//! Configuration management for the usage analytics engine
//!
//! Configuration is layered: compiled-in defaults, then an optional YAML file,
//! then environment variables prefixed with `USAGE_ANALYTICS_` using `__` as
//! the nesting separator (e.g. `USAGE_ANALYTICS_INGESTION__BATCH_SIZE=50`).

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use usage_analytics_types::Resolution;

/// Largest top-N list the aggregator maintains
pub const MAX_TOP_N: usize = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main analytics configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Event buffering and background cycle
    pub ingestion: IngestionConfig,

    /// Live window aggregation
    pub aggregation: AggregationConfig,

    /// Data retention
    pub retention: RetentionConfig,

    /// Report generation
    pub analysis: AnalysisConfig,

    /// Alert thresholds
    pub alerts: AlertConfig,

    /// Logging
    pub observability: ObservabilityConfig,
}

impl AnalyticsConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AnalyticsConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed("USAGE_ANALYTICS_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.ingestion.validate()?;
        self.aggregation.validate()?;
        self.retention.validate()?;
        self.analysis.validate()?;
        Ok(())
    }
}

/// What to do when the ingest buffer is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Drop the oldest buffered events to make room
    #[default]
    DropOldest,
    /// Drop the incoming events
    DropNewest,
    /// Refuse the incoming event and return an error to the caller
    RejectNew,
}

impl OverflowStrategy {
    /// Get strategy name for logs and alerts
    pub fn name(&self) -> &'static str {
        match self {
            Self::DropOldest => "drop_oldest",
            Self::DropNewest => "drop_newest",
            Self::RejectNew => "reject_new",
        }
    }
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Events per durable write; reaching it triggers an immediate flush
    pub batch_size: usize,

    /// Maximum delay before buffered events are flushed
    pub flush_interval_ms: u64,

    /// Hard cap on buffered events, including re-queued batches
    pub max_buffer_size: usize,

    /// Policy applied when the cap is reached
    pub overflow_strategy: OverflowStrategy,

    /// How often completed windows are swept and flushed
    pub sweep_interval_ms: u64,

    /// How often retention cleanup runs
    pub cleanup_interval_secs: u64,

    /// Upper bound on the final flush performed by `stop()`
    pub shutdown_timeout_secs: u64,
}

impl IngestionConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(invalid("ingestion.batch_size must be greater than 0"));
        }
        if self.max_buffer_size == 0 {
            return Err(invalid("ingestion.max_buffer_size must be greater than 0"));
        }
        if self.batch_size > self.max_buffer_size {
            return Err(invalid(
                "ingestion.batch_size cannot exceed ingestion.max_buffer_size",
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(invalid("ingestion.flush_interval_ms must be greater than 0"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(invalid("ingestion.sweep_interval_ms must be greater than 0"));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(invalid("ingestion.cleanup_interval_secs must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 5_000,
            max_buffer_size: 10_000,
            overflow_strategy: OverflowStrategy::DropOldest,
            sweep_interval_ms: 5_000,
            cleanup_interval_secs: 3_600,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Resolutions maintained live
    pub resolutions: Vec<Resolution>,

    /// Entries kept in each top-N list, at most 10
    pub top_n: usize,
}

impl AggregationConfig {
    fn validate(&self) -> Result<()> {
        if self.resolutions.is_empty() {
            return Err(invalid("aggregation.resolutions must not be empty"));
        }
        if self.top_n == 0 || self.top_n > MAX_TOP_N {
            return Err(invalid(format!(
                "aggregation.top_n must be between 1 and {}",
                MAX_TOP_N
            )));
        }
        Ok(())
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            resolutions: Resolution::ALL.to_vec(),
            top_n: MAX_TOP_N,
        }
    }
}

/// Retention configuration, in days
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Raw events
    pub raw_days: u32,

    /// Rollups
    pub aggregated_days: u32,
}

impl RetentionConfig {
    fn validate(&self) -> Result<()> {
        if self.raw_days == 0 || self.aggregated_days == 0 {
            return Err(invalid("retention periods must be at least one day"));
        }
        Ok(())
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_days: 7,
            aggregated_days: 90,
        }
    }
}

/// Analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Lifetime of cached reports and comparisons
    pub cache_ttl_secs: u64,

    /// Maximum cached entries; the oldest is evicted beyond this
    pub cache_capacity: usize,

    /// Confidence level of significance tests, in (0, 1)
    pub confidence_level: f64,

    /// Points produced by the linear forecast
    pub forecast_steps: usize,

    /// Sampling interval assumed when a series has fewer than two timestamps
    pub default_interval_secs: u64,

    /// Minimum absolute OLS slope reported as a trend
    pub trend_threshold: f64,

    /// Autocorrelation above which seasonality is reported
    pub seasonality_threshold: f64,

    /// Z-score above which a point is an outlier
    pub z_score_threshold: f64,
}

impl AnalysisConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn default_interval(&self) -> Duration {
        Duration::from_secs(self.default_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(invalid("analysis.confidence_level must be in (0, 1)"));
        }
        if self.cache_capacity == 0 {
            return Err(invalid("analysis.cache_capacity must be greater than 0"));
        }
        if self.default_interval_secs == 0 {
            return Err(invalid("analysis.default_interval_secs must be greater than 0"));
        }
        if self.trend_threshold < 0.0 || self.z_score_threshold <= 0.0 {
            return Err(invalid("analysis thresholds must be positive"));
        }
        Ok(())
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            cache_capacity: 100,
            confidence_level: 0.95,
            forecast_steps: 12,
            default_interval_secs: 300,
            trend_threshold: 0.05,
            seasonality_threshold: 0.5,
            z_score_threshold: 3.0,
        }
    }
}

/// Threshold breaches reported to the alert sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Forward alerts at all
    pub enabled: bool,

    /// Error rate above which a breach is reported
    pub max_error_rate: Option<f64>,

    /// p95 latency above which a breach is reported
    pub max_p95_latency_ms: Option<f64>,

    /// Cost of a single window above which a breach is reported
    pub max_window_cost: Option<f64>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_error_rate: Some(0.05),
            max_p95_latency_ms: Some(5_000.0),
            max_window_cost: None,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level or filter directive
    pub log_level: String,

    /// Enable structured JSON logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AnalyticsConfig::default();
        assert_eq!(config.ingestion.batch_size, 100);
        assert_eq!(config.analysis.confidence_level, 0.95);
        assert_eq!(config.aggregation.resolutions.len(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AnalyticsConfig::default();
        config.ingestion.batch_size = 0;
        assert!(config.validate().is_err());

        config.ingestion.batch_size = 20_000;
        assert!(config.validate().is_err());

        config.ingestion.batch_size = 100;
        config.analysis.confidence_level = 1.0;
        assert!(config.validate().is_err());

        config.analysis.confidence_level = 0.99;
        config.aggregation.top_n = 11;
        assert!(config.validate().is_err());

        config.aggregation.top_n = 5;
        config.aggregation.resolutions.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "analytics.yaml",
                r#"
ingestion:
  batch_size: 25
  overflow_strategy: drop_newest
aggregation:
  resolutions: ["1m", "1h"]
retention:
  raw_days: 3
"#,
            )?;
            jail.set_env("USAGE_ANALYTICS_ANALYSIS__CONFIDENCE_LEVEL", "0.99");

            let config = AnalyticsConfig::load(Some(PathBuf::from("analytics.yaml")))
                .map_err(|e| e.to_string())?;

            assert_eq!(config.ingestion.batch_size, 25);
            assert_eq!(config.ingestion.overflow_strategy, OverflowStrategy::DropNewest);
            assert_eq!(
                config.aggregation.resolutions,
                vec![Resolution::OneMinute, Resolution::OneHour]
            );
            assert_eq!(config.retention.raw_days, 3);
            assert_eq!(config.retention.aggregated_days, 90);
            assert_eq!(config.analysis.confidence_level, 0.99);
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("USAGE_ANALYTICS_INGESTION__BATCH_SIZE", "0");
            assert!(AnalyticsConfig::load(None).is_err());
            Ok(())
        });
    }
}
