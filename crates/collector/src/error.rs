//! Error types for ingestion and the engine facade

use thiserror::Error;
use usage_analytics_config::ConfigError;

pub type Result<T> = std::result::Result<T, CollectorError>;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid event: {0}")]
    InvalidEvent(#[from] usage_analytics_types::AnalyticsError),

    #[error("Buffer full ({capacity} events), event rejected")]
    BufferFull { capacity: usize },

    #[error("Engine is stopped")]
    Stopped,

    #[error("Persistence error: {0}")]
    Storage(#[from] processor::StorageError),

    #[error("Aggregation error: {0}")]
    Processor(#[from] processor::ProcessorError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] analyzer::AnalysisError),

    #[error("Unknown resolution: {0}")]
    UntrackedResolution(usage_analytics_types::Resolution),

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(std::time::Duration),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
