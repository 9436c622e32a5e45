//! Offline reading and summarizing of the failure log.
//!
//! The reader is lenient: unknown fields are ignored, missing fields default
//! to empty, and lines that are not UTF-8 JSON objects are counted and
//! skipped.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

use super::FailureLogError;

/// Number of subjects reported by [`FailureLogSummary`].
pub const TOP_SUBJECTS: usize = 10;
/// Number of message prefixes reported by [`FailureLogSummary`].
pub const TOP_MESSAGES: usize = 5;
/// Characters of an error message used to group similar messages.
pub const MESSAGE_PREFIX_CHARS: usize = 100;

/// A failure log line as read back, tolerant of schema drift.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FailureLogEntry {
    pub timestamp: Option<String>,
    pub task_id: Option<String>,
    pub subject_id: Option<String>,
    pub input_query: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub failed_step_name: Option<String>,
    pub failed_step_kind: Option<String>,
    pub stack_info: Option<String>,
}

impl FailureLogEntry {
    pub fn error_kind(&self) -> &str {
        self.error_kind.as_deref().unwrap_or("unknown")
    }

    pub fn failed_step(&self) -> &str {
        self.failed_step_name.as_deref().unwrap_or("unknown")
    }

    pub fn subject(&self) -> &str {
        self.subject_id.as_deref().unwrap_or("unknown")
    }

    pub fn message(&self) -> &str {
        self.error_message.as_deref().unwrap_or_default()
    }
}

/// Parsed contents of a failure log.
#[derive(Debug, Clone, Default)]
pub struct FailureLog {
    pub entries: Vec<FailureLogEntry>,
    pub malformed_lines: usize,
}

impl FailureLog {
    /// Parses JSON Lines content.
    pub fn parse(content: &str) -> Self {
        Self::parse_bytes(content.as_bytes())
    }

    /// Parses raw JSON Lines content. Lines that are not valid UTF-8 count
    /// as malformed.
    pub fn parse_bytes(content: &[u8]) -> Self {
        let mut log = Self::default();
        for raw in content.split(|b| *b == b'\n') {
            let line = match std::str::from_utf8(raw) {
                Ok(line) => line.trim(),
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping non UTF-8 failure log line");
                    log.malformed_lines += 1;
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<FailureLogEntry>(line) {
                Ok(entry) => log.entries.push(entry),
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping malformed failure log line");
                    log.malformed_lines += 1;
                }
            }
        }
        log
    }

    /// The last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> &[FailureLogEntry] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn summary(&self) -> FailureLogSummary {
        FailureLogSummary::from_entries(&self.entries, self.malformed_lines)
    }
}

/// Loads and parses a failure log file.
pub async fn load_failure_log(path: impl AsRef<Path>) -> Result<FailureLog, FailureLogError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(FailureLogError::NotFound(path.to_path_buf()));
    }
    let content = fs::read(path).await?;
    Ok(FailureLog::parse_bytes(&content))
}

/// Distribution of failures over kinds, steps, subjects and messages.
///
/// Each list is sorted by descending count, ties broken by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureLogSummary {
    pub total: usize,
    pub malformed_lines: usize,
    pub by_error_kind: Vec<(String, usize)>,
    pub by_failed_step: Vec<(String, usize)>,
    pub top_subjects: Vec<(String, usize)>,
    pub top_messages: Vec<(String, usize)>,
}

impl FailureLogSummary {
    pub fn from_entries(entries: &[FailureLogEntry], malformed_lines: usize) -> Self {
        Self {
            total: entries.len(),
            malformed_lines,
            by_error_kind: ranked(entries.iter().map(FailureLogEntry::error_kind), None),
            by_failed_step: ranked(entries.iter().map(FailureLogEntry::failed_step), None),
            top_subjects: ranked(
                entries.iter().map(FailureLogEntry::subject),
                Some(TOP_SUBJECTS),
            ),
            top_messages: ranked(
                entries
                    .iter()
                    .map(|e| message_prefix(e.message()))
                    .filter(|m| !m.is_empty()),
                Some(TOP_MESSAGES),
            ),
        }
    }
}

/// First [`MESSAGE_PREFIX_CHARS`] characters of a message.
pub fn message_prefix(message: &str) -> &str {
    match message.char_indices().nth(MESSAGE_PREFIX_CHARS) {
        Some((idx, _)) => &message[..idx],
        None => message,
    }
}

fn ranked<'a>(keys: impl Iterator<Item = &'a str>, limit: Option<usize>) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for key in keys {
        *counts.entry(key).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    if let Some(limit) = limit {
        ranked.truncate(limit);
    }
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LOG: &str = r#"{"taskId":"t1","subjectId":"concert_singer","errorKind":"RouterDeadEnd","errorMessage":"execution failed","failedStepName":"execution"}
{"taskId":"t2","subjectId":"concert_singer","errorKind":"StageInvocationError","errorMessage":"rate limited","failedStepName":"generation","someNewField":{"nested":true}}
not json at all
{"taskId":"t3","subjectId":"pets_1","errorKind":"RouterDeadEnd","errorMessage":"execution failed","failedStepName":"execution"}

{"taskId":"t4"}
"#;

    #[test]
    fn test_parse_is_lenient() {
        let log = FailureLog::parse(LOG);
        assert_eq!(log.entries.len(), 4);
        assert_eq!(log.malformed_lines, 1);
        assert_eq!(log.entries[3].error_kind(), "unknown");
        assert_eq!(log.entries[3].failed_step(), "unknown");
    }

    #[test]
    fn test_recent() {
        let log = FailureLog::parse(LOG);
        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].task_id.as_deref(), Some("t3"));
        assert_eq!(log.recent(100).len(), 4);
    }

    #[test]
    fn test_summary_counts() {
        let summary = FailureLog::parse(LOG).summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.malformed_lines, 1);
        assert_eq!(summary.by_error_kind[0], ("RouterDeadEnd".to_string(), 2));
        assert_eq!(summary.by_failed_step[0], ("execution".to_string(), 2));
        assert_eq!(summary.top_subjects[0], ("concert_singer".to_string(), 2));
        assert_eq!(summary.top_messages[0], ("execution failed".to_string(), 2));
        assert_eq!(summary.top_messages.len(), 2);
    }

    #[test]
    fn test_message_prefix_respects_char_boundaries() {
        let long = "é".repeat(150);
        assert_eq!(message_prefix(&long).chars().count(), MESSAGE_PREFIX_CHARS);
        assert_eq!(message_prefix("short"), "short");
    }

    #[tokio::test]
    async fn test_load_failure_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("error_data.log");
        assert!(matches!(
            load_failure_log(&path).await,
            Err(FailureLogError::NotFound(_))
        ));

        tokio::fs::write(&path, LOG).await.unwrap();
        let log = load_failure_log(&path).await.unwrap();
        assert_eq!(log.entries.len(), 4);
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_counted_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("error_data.log");

        let mut content = br#"{"taskId":"t1","errorKind":"RouterDeadEnd"}"#.to_vec();
        content.extend_from_slice(b"\n{\"taskId\":\"\xff\xfe\"}\n");
        content.extend_from_slice(br#"{"taskId":"t2","errorKind":"RoundLimitExceeded"}"#);
        content.push(b'\n');
        tokio::fs::write(&path, &content).await.unwrap();

        let log = load_failure_log(&path).await.unwrap();
        assert_eq!(log.entries.len(), 2);
        assert_eq!(log.malformed_lines, 1);
        assert_eq!(log.entries[1].error_kind(), "RoundLimitExceeded");
    }
}
