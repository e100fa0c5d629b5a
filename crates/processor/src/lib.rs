//! Aggregation processor for the usage analytics engine
//!
//! This crate maintains live multi-resolution rollups of usage events and
//! defines the persistence gateway they are flushed to.
//!
//! - [`window`]: bucket assignment and window lifecycle
//! - [`aggregation`]: running accumulators and window snapshots
//! - [`aggregator`]: the concurrent multi-resolution aggregator
//! - [`storage`]: gateway contract plus in-memory and Sled gateways

pub mod aggregation;
pub mod aggregator;
pub mod error;
pub mod storage;
pub mod window;

pub use aggregation::{AggregationWindow, RunningMean, TopEntry, TopN, WindowMetrics};

pub use aggregator::{AggregatorStats, MultiResolutionAggregator, SweepReport, UpdateOutcome};

pub use error::{
    ProcessorError, Result as ProcessorResult, StorageError, StorageResult, WindowError,
    WindowResult,
};

pub use storage::{
    InMemoryGateway, MemoryGatewayStats, PersistenceGateway, RetentionTarget, SeriesFilter,
    SledGateway, SledGatewayConfig,
};

pub use window::{BucketAssigner, WindowBounds, WindowKey, WindowState};
