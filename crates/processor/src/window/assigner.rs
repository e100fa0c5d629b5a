//! Window assigners
//!
//! Maps event timestamps to the tumbling bucket of every configured
//! resolution.

use super::types::{WindowBounds, WindowKey};
use chrono::{DateTime, Utc};
use usage_analytics_types::Resolution;

/// Tumbling bucket assigner across several resolutions
///
/// Buckets are aligned to the UTC epoch. Each event lands in exactly one
/// bucket per resolution.
///
/// # Example
/// ```text
/// Resolutions: 1m, 1h
/// Event at 10:07:42 -> [10:07, 10:08), [10:00, 11:00)
/// ```
#[derive(Debug, Clone)]
pub struct BucketAssigner {
    resolutions: Vec<Resolution>,
}

impl BucketAssigner {
    /// Create an assigner; duplicate resolutions are collapsed
    pub fn new(resolutions: impl IntoIterator<Item = Resolution>) -> Self {
        let mut resolutions: Vec<Resolution> = resolutions.into_iter().collect();
        resolutions.sort();
        resolutions.dedup();
        Self { resolutions }
    }

    pub fn resolutions(&self) -> &[Resolution] {
        &self.resolutions
    }

    /// Bounds of the bucket containing `timestamp` at one resolution
    pub fn bounds(resolution: Resolution, timestamp: DateTime<Utc>) -> WindowBounds {
        let start = resolution.bucket_start(timestamp);
        WindowBounds::new(start, start + resolution.duration())
    }

    /// One key and bounds per resolution
    pub fn assign(&self, timestamp: DateTime<Utc>) -> Vec<(WindowKey, WindowBounds)> {
        self.resolutions
            .iter()
            .map(|&resolution| {
                (
                    WindowKey::new(resolution, resolution.bucket_key(timestamp)),
                    Self::bounds(resolution, timestamp),
                )
            })
            .collect()
    }
}

impl Default for BucketAssigner {
    fn default() -> Self {
        Self::new(Resolution::ALL)
    }
}
