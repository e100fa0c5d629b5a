//! Core types and data models for the usage analytics engine
//!
//! This crate provides the data structures shared by the aggregation,
//! analysis and ingestion crates: usage events, resolutions, time-series
//! points and analysis results.

pub mod errors;
pub mod events;
pub mod metrics;
pub mod resolution;
pub mod series;

pub use errors::{AnalyticsError, Result};
pub use events::{AiRequest, EventDraft, EventKind, EventPayload, UsageEvent};
pub use metrics::{
    AnomalyPoint, AnomalySeverity, AnomalyType, ComparisonResult, ForecastPoint,
    MetricComparison, MetricsSummary, Seasonality, Trend,
};
pub use resolution::{Resolution, TimeRange};
pub use series::{SeriesMetric, TimeSeriesPoint};
