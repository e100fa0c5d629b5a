//! Window accumulators
//!
//! - [`RunningMean`]: order-dependent incremental mean used for latency and 0/1 rates
//! - [`TopN`]: bounded busiest-key list, resorted on every update
//! - [`AggregationWindow`]: one bucket's accumulators plus its lifecycle state
//! - [`WindowMetrics`]: a torn-free copy of a window, also the persisted rollup
//!
//! # Examples
//!
//! ```rust
//! use processor::aggregation::TopN;
//!
//! let mut models = TopN::new(10);
//! models.record("gpt-4o", 0.03);
//! models.record("claude-3-haiku", 0.001);
//! models.record("claude-3-haiku", 0.001);
//!
//! assert_eq!(models.entries()[0].key, "claude-3-haiku");
//! ```

pub mod running;
pub mod top_n;
pub mod window;

pub use running::RunningMean;
pub use top_n::{TopEntry, TopN};
pub use window::{AggregationWindow, WindowMetrics};
