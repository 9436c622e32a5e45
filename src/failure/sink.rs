//! Failure sinks.
//!
//! A sink must never fail the run it records: write errors are logged and
//! swallowed so the original failure still reaches the caller.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::record::FailureRecord;
use super::FailureLogError;
use crate::pipeline::error::ErrorKind;
use crate::trace::ExecutionTrace;

/// Default location of the failure log.
pub const DEFAULT_FAILURE_LOG: &str = "logs/error_data.log";

/// Destination for failure records.
#[async_trait]
pub trait FailureSink: Send + Sync {
    /// Records one terminal failure. Never fails.
    async fn record(
        &self,
        trace: &ExecutionTrace,
        kind: ErrorKind,
        message: &str,
        stack_info: Option<&str>,
    );
}

/// Appends failure records to a JSON Lines file.
///
/// Appends from concurrent tasks are serialized so lines never interleave.
pub struct JsonlFailureSink {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlFailureSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record as a line, creating parent directories on demand.
    pub async fn append(&self, record: &FailureRecord) -> Result<(), FailureLogError> {
        let mut line = record.to_json_line()?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

impl Default for JsonlFailureSink {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_LOG)
    }
}

#[async_trait]
impl FailureSink for JsonlFailureSink {
    async fn record(
        &self,
        trace: &ExecutionTrace,
        kind: ErrorKind,
        message: &str,
        stack_info: Option<&str>,
    ) {
        let record = FailureRecord::from_trace(trace, kind, message, stack_info);
        match self.append(&record).await {
            Ok(()) => tracing::info!(
                task_id = %record.task_id,
                error_kind = %kind,
                failed_step = %record.failed_step_name,
                path = %self.path.display(),
                "Recorded failure"
            ),
            Err(e) => tracing::error!(
                task_id = %record.task_id,
                error_kind = %kind,
                path = %self.path.display(),
                error = %e,
                "Failed to write failure record"
            ),
        }
    }
}

/// Keeps failure records in memory.
#[derive(Default)]
pub struct MemoryFailureSink {
    records: Mutex<Vec<FailureRecord>>,
}

impl MemoryFailureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<FailureRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FailureSink for MemoryFailureSink {
    async fn record(
        &self,
        trace: &ExecutionTrace,
        kind: ErrorKind,
        message: &str,
        stack_info: Option<&str>,
    ) {
        let record = FailureRecord::from_trace(trace, kind, message, stack_info);
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::StepKind;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn failed_trace(task_id: &str) -> ExecutionTrace {
        let mut trace = ExecutionTrace::new(task_id, "concert_singer", "How many singers?");
        trace.start_step("analysis", StepKind::Agent, "q").unwrap();
        trace.fail("boom").unwrap();
        trace
    }

    #[tokio::test]
    async fn test_jsonl_sink_creates_directories_and_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/logs/error_data.log");
        let sink = JsonlFailureSink::new(&path);

        sink.record(&failed_trace("t1"), ErrorKind::StageInvocationError, "boom", None)
            .await;
        sink.record(&failed_trace("t2"), ErrorKind::RouterDeadEnd, "dead", None)
            .await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: FailureRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.task_id, "t2");
        assert_eq!(second.failed_step_name, "analysis");
    }

    #[tokio::test]
    async fn test_concurrent_appends_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(JsonlFailureSink::new(dir.path().join("error_data.log")));

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    let trace = failed_trace(&format!("task-{}", i));
                    sink.record(&trace, ErrorKind::StageInvocationError, "boom", None)
                        .await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let content = tokio::fs::read_to_string(sink.path()).await.unwrap();
        let records: Vec<FailureRecord> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 20);
    }

    #[tokio::test]
    async fn test_write_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be makes the open fail.
        let path = dir.path().join("error_data.log");
        tokio::fs::create_dir_all(&path).await.unwrap();
        let sink = JsonlFailureSink::new(&path);

        sink.record(&failed_trace("t1"), ErrorKind::StageInvocationError, "boom", None)
            .await;
        assert!(sink.append(&FailureRecord::from_trace(
            &failed_trace("t2"),
            ErrorKind::StageInvocationError,
            "boom",
            None
        ))
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemoryFailureSink::new();
        assert!(sink.is_empty());
        sink.record(&failed_trace("t1"), ErrorKind::RoundLimitExceeded, "limit", Some("trace"))
            .await;
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error_kind, ErrorKind::RoundLimitExceeded);
        assert_eq!(records[0].stack_info.as_deref(), Some("trace"));
    }

    #[test]
    fn test_default_path() {
        assert_eq!(
            JsonlFailureSink::default().path(),
            Path::new(DEFAULT_FAILURE_LOG)
        );
    }
}
