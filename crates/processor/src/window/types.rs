//! Window types and bounds
//!
//! Bounds, keys and the lifecycle state of the bucketed accumulators kept
//! by the aggregator.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use usage_analytics_types::Resolution;

/// Represents the time bounds of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowBounds {
    /// Start time of the window (inclusive)
    pub start: DateTime<Utc>,
    /// End time of the window (exclusive)
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    /// Create a new window bounds
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(start < end, "Window start must be before end");
        Self { start, end }
    }

    /// Get the duration of the window
    pub fn duration(&self) -> Duration {
        self.end.signed_duration_since(self.start)
    }

    /// Check if a timestamp falls within this window
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Whether the window's wall-clock end has passed
    pub fn is_complete(&self, now: DateTime<Utc>) -> bool {
        self.end <= now
    }
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} - {})",
            self.start.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.end.format("%Y-%m-%d %H:%M:%S%.3f")
        )
    }
}

impl PartialOrd for WindowBounds {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WindowBounds {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.end.cmp(&other.end))
    }
}

/// Identity of a window: resolution plus bucket key (bucket start in epoch millis)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    pub resolution: Resolution,
    pub bucket: i64,
}

impl WindowKey {
    pub fn new(resolution: Resolution, bucket: i64) -> Self {
        Self { resolution, bucket }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.resolution, self.bucket)
    }
}

/// Lifecycle of a window
///
/// ```text
/// Open -> Closed -> Flushed -> Evicted
/// ```
///
/// Each step happens at most once and a window never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    /// Accepting events
    Open,
    /// End time passed; frozen and waiting to be persisted
    Closed,
    /// Persisted to the gateway
    Flushed,
    /// Dropped from memory
    Evicted,
}

impl WindowState {
    /// The only state this one may move to
    pub fn next(&self) -> Option<WindowState> {
        match self {
            Self::Open => Some(Self::Closed),
            Self::Closed => Some(Self::Flushed),
            Self::Flushed => Some(Self::Evicted),
            Self::Evicted => None,
        }
    }

    pub fn accepts_events(&self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Flushed => "flushed",
            Self::Evicted => "evicted",
        };
        f.write_str(s)
    }
}
