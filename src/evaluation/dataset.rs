//! Spider-style dataset files.
//!
//! A dataset is a JSON array of objects with `db_id`, `question` and the
//! gold `query`. DuSQL-style files add a `question_id`, which may be a string
//! or a number; items without one are numbered by position.

use serde::{Deserialize, Deserializer};
use std::path::Path;
use tokio::fs;

use super::EvaluationError;

/// One question of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatasetItem {
    #[serde(default, deserialize_with = "deserialize_question_id")]
    pub question_id: Option<String>,
    pub db_id: String,
    pub question: String,
    /// Gold SQL. Prediction-only datasets may omit it.
    #[serde(default)]
    pub query: String,
}

impl DatasetItem {
    /// The item's identifier, or its 1-based position when it has none.
    pub fn qid(&self, position: usize) -> String {
        self.question_id
            .clone()
            .unwrap_or_else(|| format!("q{}", position))
    }
}

fn deserialize_question_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Loads a dataset, keeping at most `limit` items when given.
pub async fn load_dataset(
    path: impl AsRef<Path>,
    limit: Option<usize>,
) -> Result<Vec<DatasetItem>, EvaluationError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(EvaluationError::NotFound(path.to_path_buf()));
    }

    let content = fs::read_to_string(path).await?;
    let mut items: Vec<DatasetItem> = serde_json::from_str(&content)?;
    if let Some(limit) = limit {
        items.truncate(limit);
    }

    tracing::info!(path = %path.display(), items = items.len(), "Loaded dataset");
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DATASET: &str = r#"[
        {"db_id": "concert_singer", "question": "How many singers do we have?", "query": "SELECT count(*) FROM singer", "query_toks": ["SELECT"]},
        {"question_id": 17, "db_id": "pets_1", "question": "How many pets?", "query": "SELECT count(*) FROM pets"},
        {"question_id": "qid-3", "db_id": "pets_1", "question": "List pet types."}
    ]"#;

    #[tokio::test]
    async fn test_load_dataset_accepts_mixed_ids() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dev.json");
        tokio::fs::write(&path, DATASET).await.unwrap();

        let items = load_dataset(&path, None).await.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].qid(1), "q1");
        assert_eq!(items[1].qid(2), "17");
        assert_eq!(items[2].qid(3), "qid-3");
        assert_eq!(items[2].query, "");
    }

    #[tokio::test]
    async fn test_load_dataset_limit_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dev.json");
        assert!(matches!(
            load_dataset(&path, None).await,
            Err(EvaluationError::NotFound(_))
        ));

        tokio::fs::write(&path, DATASET).await.unwrap();
        let items = load_dataset(&path, Some(2)).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].db_id, "pets_1");
    }
}
