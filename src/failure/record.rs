//! Failure record written once per failed run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::pipeline::error::ErrorKind;
use crate::trace::{ExecutionTrace, TraceRecord};

/// Placeholder for the failed step when the trace holds no usable step.
pub const UNKNOWN: &str = "unknown";

/// One terminal failure, serialized as a single JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,

    /// Task that failed.
    pub task_id: String,

    /// Database the task ran against.
    pub subject_id: String,

    /// The natural-language question.
    pub input_query: String,

    /// Error classification.
    pub error_kind: ErrorKind,

    /// Human-readable error.
    pub error_message: String,

    /// Name of the step that failed, or `unknown`.
    pub failed_step_name: String,

    /// Kind of the step that failed, or `unknown`.
    pub failed_step_kind: String,

    /// Error source chain, when available.
    pub stack_info: Option<String>,

    /// Full trace at the time of failure.
    pub full_trace_snapshot: TraceRecord,

    /// Free-form annotations, copied from the trace.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl FailureRecord {
    /// Builds a record from a trace.
    ///
    /// The failed step is the trace's current step if it failed or is still
    /// running, else the last failed step, else `unknown`.
    pub fn from_trace(
        trace: &ExecutionTrace,
        kind: ErrorKind,
        message: &str,
        stack_info: Option<&str>,
    ) -> Self {
        let (failed_step_name, failed_step_kind) = trace
            .failed_step()
            .map(|step| (step.name.clone(), step.kind.as_str().to_string()))
            .unwrap_or_else(|| (UNKNOWN.to_string(), UNKNOWN.to_string()));

        Self {
            timestamp: Utc::now(),
            task_id: trace.task_id().to_string(),
            subject_id: trace.subject_id().to_string(),
            input_query: trace.input_query().to_string(),
            error_kind: kind,
            error_message: message.to_string(),
            failed_step_name,
            failed_step_kind,
            stack_info: stack_info.map(str::to_string),
            full_trace_snapshot: trace.to_record(),
            metadata: trace.metadata().clone(),
        }
    }

    /// Single-line JSON form.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
