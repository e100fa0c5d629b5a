//! Persistence gateway contract
//!
//! The durable sink/source for raw events and rollups. Any store that can
//! insert, query by time range and delete by cutoff satisfies it; the
//! aggregator and the ingest cycle only ever talk to this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use usage_analytics_types::{Resolution, SeriesMetric, TimeRange, TimeSeriesPoint, UsageEvent};

use super::series;
use crate::aggregation::WindowMetrics;
use crate::error::StorageResult;

/// What a retention sweep deletes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionTarget {
    RawEvents,
    Rollups,
}

impl fmt::Display for RetentionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RawEvents => f.write_str("raw_events"),
            Self::Rollups => f.write_str("rollups"),
        }
    }
}

/// Selects the series a query returns
///
/// Without a feature or model filter the series is read from rollups at
/// `resolution`; with one, it is rebuilt from raw events bucketed at
/// `resolution`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesFilter {
    pub metric: SeriesMetric,
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl SeriesFilter {
    pub fn new(metric: SeriesMetric, resolution: Resolution) -> Self {
        Self {
            metric,
            resolution,
            feature_id: None,
            model: None,
        }
    }

    pub fn with_feature(mut self, feature_id: impl Into<String>) -> Self {
        self.feature_id = Some(feature_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Whether the filter narrows below what rollups record
    pub fn needs_raw_events(&self) -> bool {
        self.feature_id.is_some() || self.model.is_some()
    }

    /// Whether an event passes the feature/model filter
    pub fn matches(&self, event: &UsageEvent) -> bool {
        let feature_ok = self
            .feature_id
            .as_deref()
            .map_or(true, |f| event.feature_id() == Some(f));
        let model_ok = self
            .model
            .as_deref()
            .map_or(true, |m| event.model() == Some(m));
        feature_ok && model_ok
    }
}

/// Durable store for raw events and rollups
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Short backend name used in logs and errors
    fn backend_name(&self) -> &'static str;

    /// Persist a batch of raw events
    ///
    /// A retried batch may contain events already stored; stores keyed by
    /// event id collapse such duplicates.
    async fn insert_events(&self, batch: &[UsageEvent]) -> StorageResult<()>;

    /// Persist rollups of closed windows
    async fn insert_rollups(&self, batch: &[WindowMetrics]) -> StorageResult<()>;

    /// Delete everything of `target` timestamped strictly before `cutoff`;
    /// returns the number of records removed
    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        target: RetentionTarget,
    ) -> StorageResult<usize>;

    /// Raw events whose timestamp falls in `range`, oldest first
    async fn query_events(&self, range: TimeRange) -> StorageResult<Vec<UsageEvent>>;

    /// Rollups at `resolution` whose window starts in `range`, oldest first
    async fn query_rollups(
        &self,
        resolution: Resolution,
        range: TimeRange,
    ) -> StorageResult<Vec<WindowMetrics>>;

    /// Metric series for `filter` over `range`, oldest first
    async fn query_series(
        &self,
        filter: &SeriesFilter,
        range: TimeRange,
    ) -> StorageResult<Vec<TimeSeriesPoint>> {
        if filter.needs_raw_events() {
            let events = self.query_events(range).await?;
            Ok(series::series_from_events(&events, filter))
        } else {
            let rollups = self.query_rollups(filter.resolution, range).await?;
            Ok(series::series_from_rollups(&rollups, filter.metric))
        }
    }
}
