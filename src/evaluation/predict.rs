//! Batch prediction over a dataset.

use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs;

use super::{DatasetItem, EvaluationError};
use crate::pipeline::{Nl2SqlService, QueryRequest};

/// Written in place of a prediction when the pipeline produced no usable SQL.
pub const FALLBACK_SQL: &str = "SELECT *";

/// Header line of a predictions file.
pub const PREDICTIONS_HEADER: &str = "qid\tSQL query\tdb_id";

/// One predicted query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prediction {
    pub qid: String,
    pub sql: String,
    pub db_id: String,
}

/// Outcome of a prediction batch.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionReport {
    pub predictions: Vec<Prediction>,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

impl PredictionReport {
    pub fn total(&self) -> usize {
        self.predictions.len()
    }

    /// Mean wall time per question.
    pub fn average(&self) -> Duration {
        match self.total() {
            0 => Duration::ZERO,
            n => self.elapsed / n as u32,
        }
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// Normalizes a predicted statement to a single line.
///
/// Anything that does not start with `SELECT` or `WITH` becomes
/// [`FALLBACK_SQL`]; a trailing `;` is dropped and whitespace runs collapse
/// to one space.
pub fn clean_prediction(sql: Option<&str>) -> String {
    let Some(sql) = sql.map(str::trim).filter(|s| !s.is_empty()) else {
        return FALLBACK_SQL.to_string();
    };

    let upper = sql.to_uppercase();
    if !(upper.starts_with("SELECT") || upper.starts_with("WITH")) {
        return FALLBACK_SQL.to_string();
    }

    let sql = sql.trim_end_matches(';');
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Runs every item through `service`, one question at a time.
///
/// A question whose run fails, or which ends without a statement, is
/// recorded with [`FALLBACK_SQL`] and counted as failed.
pub async fn predict_all(service: &Nl2SqlService, items: &[DatasetItem]) -> PredictionReport {
    let started = Instant::now();
    let mut predictions = Vec::with_capacity(items.len());
    let mut succeeded = 0;
    let mut failed = 0;

    for (idx, item) in items.iter().enumerate() {
        let qid = item.qid(idx + 1);
        let request = QueryRequest::new(&item.db_id, &item.question);

        let sql = match service.execute(request).await {
            Ok(response) if response.sql.is_some() => {
                succeeded += 1;
                clean_prediction(response.sql.as_deref())
            }
            Ok(response) => {
                tracing::warn!(qid = %qid, task_id = %response.task_id, "Run finished without a SQL statement");
                failed += 1;
                FALLBACK_SQL.to_string()
            }
            Err(failure) => {
                tracing::warn!(qid = %qid, task_id = %failure.task_id, kind = %failure.kind, error = %failure.message, "Prediction failed");
                failed += 1;
                FALLBACK_SQL.to_string()
            }
        };

        tracing::debug!(qid = %qid, progress = idx + 1, total = items.len(), "Predicted");
        predictions.push(Prediction {
            qid,
            sql,
            db_id: item.db_id.clone(),
        });
    }

    let report = PredictionReport {
        predictions,
        succeeded,
        failed,
        elapsed: started.elapsed(),
    };
    tracing::info!(
        total = report.total(),
        succeeded = report.succeeded,
        failed = report.failed,
        elapsed_secs = report.elapsed.as_secs_f64(),
        "Prediction batch finished"
    );
    report
}

/// Writes predictions as a tab-separated file with [`PREDICTIONS_HEADER`].
pub async fn write_predictions(
    path: impl AsRef<Path>,
    predictions: &[Prediction],
) -> Result<(), EvaluationError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let mut out = String::from(PREDICTIONS_HEADER);
    out.push('\n');
    for p in predictions {
        out.push_str(&format!("{}\t{}\t{}\n", p.qid, p.sql, p.db_id));
    }
    fs::write(path, out).await?;

    tracing::info!(path = %path.display(), count = predictions.len(), "Wrote predictions");
    Ok(())
}

/// Reads a predictions file written by [`write_predictions`].
///
/// The header line is optional; blank lines are skipped.
pub async fn load_predictions(path: impl AsRef<Path>) -> Result<Vec<Prediction>, EvaluationError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(EvaluationError::NotFound(path.to_path_buf()));
    }

    let content = fs::read_to_string(path).await?;
    let mut predictions = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || (idx == 0 && line == PREDICTIONS_HEADER) {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        let [qid, sql, db_id] = fields[..] else {
            return Err(EvaluationError::MalformedPredictions {
                line: idx + 1,
                message: format!("expected 3 tab-separated fields, found {}", fields.len()),
            });
        };
        predictions.push(Prediction {
            qid: qid.to_string(),
            sql: sql.to_string(),
            db_id: db_id.to_string(),
        });
    }
    Ok(predictions)
}
