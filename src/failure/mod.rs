//! Durable capture of failed runs.
//!
//! Every run that ends in failure produces one [`FailureRecord`] holding the
//! error classification and a full snapshot of the trace. The default
//! [`JsonlFailureSink`] appends records to `logs/error_data.log`, one JSON
//! object per line; [`analysis`] reads the log back for offline inspection.

pub mod analysis;
pub mod record;
pub mod sink;

use std::path::PathBuf;
use thiserror::Error;

pub use analysis::{load_failure_log, FailureLog, FailureLogEntry, FailureLogSummary};
pub use record::{FailureRecord, UNKNOWN};
pub use sink::{FailureSink, JsonlFailureSink, MemoryFailureSink, DEFAULT_FAILURE_LOG};

/// Errors that can occur while writing or reading the failure log.
#[derive(Debug, Error)]
pub enum FailureLogError {
    #[error("Failure log not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
