//! Windowing for multi-resolution aggregation
//!
//! - [`BucketAssigner`]: maps a timestamp to one tumbling bucket per resolution
//! - [`WindowBounds`] / [`WindowKey`]: identity of a bucket
//! - [`WindowState`]: the `Open -> Closed -> Flushed -> Evicted` lifecycle

pub mod assigner;
pub mod types;

pub use assigner::BucketAssigner;
pub use types::{WindowBounds, WindowKey, WindowState};
