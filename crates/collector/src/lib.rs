//! Usage analytics collector
//!
//! This crate accepts usage events, buffers them with a bounded overflow
//! policy, folds them into live multi-resolution windows and runs the
//! background cycle that persists events, sweeps completed windows and
//! applies retention. [`UsageAnalytics`] is the engine facade tying ingestion
//! to the analysis components, with cached reports and alert delivery.

pub mod alerts;
pub mod buffer;
pub mod cache;
pub mod clock;
pub mod engine;
pub mod error;
pub mod ingestor;
pub mod logging;
pub mod report;

pub use alerts::{Alert, AlertKind, AlertSink, LoggingAlertSink, RecordingAlertSink};

pub use buffer::{BufferStats, EventBuffer, PushOutcome};

pub use cache::ResultCache;

pub use clock::{Clock, ManualClock, SystemClock};

pub use engine::{EngineStats, UsageAnalytics};

pub use error::{CollectorError, Result};

pub use ingestor::{EventIngestor, IngestorStats, RetentionReport};

pub use logging::init_tracing;

pub use report::{AnalysisOptions, AnalysisReport, MetricForecast, MetricReport};
