//! Error types for the aggregation processor
//!
//! Window lifecycle violations, storage gateway failures and the umbrella
//! `ProcessorError` returned by aggregator operations.

use thiserror::Error;

use crate::window::WindowState;

/// Main processor error type
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Window-related errors
    #[error("window error: {0}")]
    Window(#[from] WindowError),

    /// Persistence gateway errors
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Window assignment and lifecycle errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WindowError {
    /// Event targets a window that no longer accepts updates
    #[error("window not open: window_id={window_id}, state={state}")]
    WindowNotOpen {
        window_id: String,
        state: WindowState,
    },

    /// Event targets a bucket that has already been swept
    #[error("late event: bucket {bucket_start} closed before watermark {watermark}")]
    LateEvent { bucket_start: i64, watermark: i64 },

    /// Lifecycle step out of order
    #[error("invalid window transition for {window_id}: {from} -> {to}")]
    InvalidTransition {
        window_id: String,
        from: WindowState,
        to: WindowState,
    },
}

/// Persistence gateway errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend could not be reached or refused the write
    #[error("storage unavailable in {backend_type}: {details}")]
    Unavailable {
        backend_type: String,
        details: String,
    },

    /// Backend reported a failure
    #[error("storage error in {backend_type}: {details}")]
    Backend {
        backend_type: String,
        details: String,
    },

    /// Stored value could not be encoded or decoded
    #[error("serialization failed for key '{key}': {reason}")]
    Serialization { key: String, reason: String },
}

impl StorageError {
    pub(crate) fn backend(backend_type: &str, details: impl ToString) -> Self {
        Self::Backend {
            backend_type: backend_type.to_string(),
            details: details.to_string(),
        }
    }
}

/// Result type alias for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Result type alias for window operations
pub type WindowResult<T> = std::result::Result<T, WindowError>;

/// Result type alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;
