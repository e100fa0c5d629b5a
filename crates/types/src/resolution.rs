//! Aggregation resolutions and time ranges

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Time granularity of an aggregation window
///
/// Buckets are aligned to the UTC epoch, so a day bucket starts at midnight UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "1d")]
    OneDay,
}

impl Resolution {
    /// All supported resolutions, finest first
    pub const ALL: [Resolution; 4] = [
        Resolution::OneMinute,
        Resolution::FiveMinutes,
        Resolution::OneHour,
        Resolution::OneDay,
    ];

    /// Bucket width in milliseconds
    pub fn as_millis(&self) -> i64 {
        match self {
            Self::OneMinute => 60_000,
            Self::FiveMinutes => 5 * 60_000,
            Self::OneHour => 60 * 60_000,
            Self::OneDay => 24 * 60 * 60_000,
        }
    }

    /// Bucket width as a duration
    pub fn duration(&self) -> Duration {
        Duration::milliseconds(self.as_millis())
    }

    /// Bucket key for a timestamp: its epoch millis floored to the bucket width
    pub fn bucket_key(&self, timestamp: DateTime<Utc>) -> i64 {
        timestamp.timestamp_millis().div_euclid(self.as_millis()) * self.as_millis()
    }

    /// Start of the bucket containing `timestamp`
    pub fn bucket_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.bucket_key(timestamp))
            .single()
            .unwrap_or(timestamp)
    }

    /// Short label, e.g. `5m`
    pub fn label(&self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::OneHour => "1h",
            Self::OneDay => "1d",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" | "minute" => Ok(Self::OneMinute),
            "5m" | "5minute" => Ok(Self::FiveMinutes),
            "1h" | "hour" => Ok(Self::OneHour),
            "1d" | "day" => Ok(Self::OneDay),
            other => Err(format!("unknown resolution: {}", other)),
        }
    }
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Create a range; the bounds are swapped if given in reverse
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// Range covering the `duration` leading up to `end`
    pub fn last(duration: Duration, end: DateTime<Utc>) -> Self {
        Self::new(end - duration, end)
    }

    /// Check if a timestamp falls within the range
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Length of the range
    pub fn duration(&self) -> Duration {
        self.end.signed_duration_since(self.start)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} - {})",
            self.start.format("%Y-%m-%d %H:%M:%S"),
            self.end.format("%Y-%m-%d %H:%M:%S")
        )
    }
}
