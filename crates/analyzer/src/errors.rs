//! Error types for the analysis engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Statistical error: {0}")]
    StatisticalError(String),

    #[error("Series query failed: {0}")]
    Storage(#[from] processor::StorageError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
