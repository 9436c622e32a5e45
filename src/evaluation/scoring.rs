//! Exact-match scoring of predictions against gold queries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

use super::{DatasetItem, EvaluationError, Prediction};

/// Upper-cases `sql` and collapses whitespace runs to one space.
pub fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace()
        .map(str::to_uppercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Per-question comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDetails {
    pub exact_match: bool,
    pub gt_length: usize,
    pub pred_length: usize,
    pub has_select: bool,
    pub has_where: bool,
    pub has_and: bool,
    pub has_or: bool,
}

/// Compares one prediction with its gold query.
///
/// The clause flags describe the prediction.
pub fn score_prediction(gold: &str, predicted: &str) -> MatchDetails {
    let gold = normalize_sql(gold);
    let predicted = normalize_sql(predicted);
    let words: Vec<&str> = predicted.split(' ').collect();
    let has = |keyword: &str| words.contains(&keyword);

    MatchDetails {
        exact_match: gold == predicted,
        gt_length: gold.len(),
        pred_length: predicted.len(),
        has_select: has("SELECT"),
        has_where: has("WHERE"),
        has_and: has("AND"),
        has_or: has("OR"),
    }
}

/// One scored question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationDetail {
    pub qid: String,
    pub db_id: String,
    pub question: String,
    pub gold: String,
    /// `None` when the predictions file has no entry for this question.
    pub predicted: Option<String>,
    pub details: Option<MatchDetails>,
}

/// Aggregate of a scoring run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub total: usize,
    pub exact_match: usize,
    pub mismatched: usize,
    pub missing: usize,
    pub accuracy: f64,
    pub details: Vec<EvaluationDetail>,
}

impl EvaluationReport {
    /// Questions whose prediction differs from the gold query.
    pub fn mismatches(&self) -> impl Iterator<Item = &EvaluationDetail> {
        self.details
            .iter()
            .filter(|d| d.details.as_ref().is_some_and(|m| !m.exact_match))
    }
}

/// Scores `predictions` against the gold queries of `items`.
///
/// Predictions are matched by question id, so order does not matter. Items
/// without a prediction count as missing and score as wrong.
pub fn evaluate(items: &[DatasetItem], predictions: &[Prediction]) -> EvaluationReport {
    let by_qid: HashMap<&str, &Prediction> =
        predictions.iter().map(|p| (p.qid.as_str(), p)).collect();

    let mut exact_match = 0;
    let mut mismatched = 0;
    let mut missing = 0;
    let mut details = Vec::with_capacity(items.len());

    for (idx, item) in items.iter().enumerate() {
        let qid = item.qid(idx + 1);
        let predicted = by_qid.get(qid.as_str()).map(|p| p.sql.clone());
        let scored = predicted.as_deref().map(|sql| score_prediction(&item.query, sql));

        match &scored {
            Some(m) if m.exact_match => exact_match += 1,
            Some(_) => mismatched += 1,
            None => missing += 1,
        }

        details.push(EvaluationDetail {
            qid,
            db_id: item.db_id.clone(),
            question: item.question.clone(),
            gold: item.query.clone(),
            predicted,
            details: scored,
        });
    }

    let total = items.len();
    let accuracy = if total == 0 {
        0.0
    } else {
        exact_match as f64 / total as f64
    };

    tracing::info!(total, exact_match, mismatched, missing, accuracy, "Evaluation finished");

    EvaluationReport {
        total,
        exact_match,
        mismatched,
        missing,
        accuracy,
        details,
    }
}

/// Writes `report` as pretty-printed JSON.
pub async fn write_report(
    path: impl AsRef<Path>,
    report: &EvaluationReport,
) -> Result<(), EvaluationError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, serde_json::to_string_pretty(report)?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(id: &str, query: &str) -> DatasetItem {
        DatasetItem {
            question_id: Some(id.to_string()),
            db_id: "concert_singer".to_string(),
            question: format!("question {}", id),
            query: query.to_string(),
        }
    }

    fn prediction(qid: &str, sql: &str) -> Prediction {
        Prediction {
            qid: qid.to_string(),
            sql: sql.to_string(),
            db_id: "concert_singer".to_string(),
        }
    }

    #[test]
    fn test_normalize_sql() {
        assert_eq!(
            normalize_sql("  select name\n\tfrom   singer "),
            "SELECT NAME FROM SINGER"
        );
        assert_eq!(normalize_sql(""), "");
    }

    #[test]
    fn test_score_prediction_flags() {
        let m = score_prediction(
            "SELECT name FROM singer WHERE age > 30",
            "select name from singer where age > 30 or age < 20",
        );
        assert!(!m.exact_match);
        assert!(m.has_select && m.has_where && m.has_or);
        assert!(!m.has_and);
        assert_eq!(m.gt_length, "SELECT NAME FROM SINGER WHERE AGE > 30".len());

        // Keywords inside identifiers do not count.
        let m = score_prediction("SELECT 1", "SELECT brand FROM orders");
        assert!(!m.has_and && !m.has_or);
    }

    #[test]
    fn test_evaluate_matches_by_qid() {
        let items = vec![
            item("1", "SELECT count(*) FROM singer"),
            item("2", "SELECT name FROM singer WHERE age > 30"),
            item("3", "SELECT avg(age) FROM singer"),
        ];
        let predictions = vec![
            prediction("2", "SELECT name FROM singer"),
            prediction("1", "select COUNT(*)  from singer"),
        ];

        let report = evaluate(&items, &predictions);
        assert_eq!(report.total, 3);
        assert_eq!(report.exact_match, 1);
        assert_eq!(report.mismatched, 1);
        assert_eq!(report.missing, 1);
        assert!((report.accuracy - 1.0 / 3.0).abs() < 1e-9);

        assert_eq!(report.details[2].predicted, None);
        let mismatched: Vec<&str> = report.mismatches().map(|d| d.qid.as_str()).collect();
        assert_eq!(mismatched, vec!["2"]);
    }

    #[test]
    fn test_evaluate_empty_dataset() {
        let report = evaluate(&[], &[prediction("1", "SELECT 1")]);
        assert_eq!(report.total, 0);
        assert_eq!(report.accuracy, 0.0);
    }

    #[tokio::test]
    async fn test_write_report() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results").join("eval.json");
        let report = evaluate(&[item("1", "SELECT 1")], &[prediction("1", "SELECT 1")]);

        write_report(&path, &report).await.unwrap();
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: EvaluationReport = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed, report);
        assert!(content.contains("\"exact_match\": 1"));
    }
}
