//! Batch prediction and exact-match scoring over NL2SQL datasets.
//!
//! - [`dataset`] loads Spider-style question files
//! - [`predict`] runs each question through an [`Nl2SqlService`] and writes
//!   a tab-separated predictions file
//! - [`scoring`] compares predictions with gold queries after upper-casing
//!   and whitespace collapsing
//!
//! [`Nl2SqlService`]: crate::pipeline::Nl2SqlService

pub mod dataset;
pub mod predict;
pub mod scoring;

use std::path::PathBuf;
use thiserror::Error;

pub use dataset::{load_dataset, DatasetItem};
pub use predict::{
    clean_prediction, load_predictions, predict_all, write_predictions, Prediction,
    PredictionReport, FALLBACK_SQL, PREDICTIONS_HEADER,
};
pub use scoring::{
    evaluate, normalize_sql, score_prediction, write_report, EvaluationDetail, EvaluationReport,
    MatchDetails,
};

/// Errors raised while reading or writing evaluation files.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed predictions file at line {line}: {message}")]
    MalformedPredictions { line: usize, message: String },
}
