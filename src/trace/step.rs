//! A single step of an execution trace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::error::TraceError;

/// What kind of work a step performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Schema loading and formatting.
    Schema,
    /// A language-model stage.
    Agent,
    /// SQL execution.
    Execution,
    /// Result validation.
    Validation,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Schema => "schema",
            StepKind::Agent => "agent",
            StepKind::Execution => "execution",
            StepKind::Validation => "validation",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Whether the step can no longer change.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of recorded work: a stage invocation or a named phase.
///
/// Created `pending`; `start` moves it to `running`, after which exactly one
/// of `complete` or `fail` ends it. A pending step may instead be skipped.
/// `duration_secs` is set only for steps that started and then succeeded or
/// failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    /// Step name; the stage name for stage invocations.
    pub name: String,

    /// Category of work performed.
    pub kind: StepKind,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Current lifecycle state.
    pub status: StepStatus,

    /// Snapshot of the input the step started with.
    pub input: Option<String>,

    /// Output recorded on success.
    pub output: Option<String>,

    /// Error recorded on failure, or the reason a step was skipped.
    pub error: Option<String>,

    /// When the step started running.
    pub start_time: Option<DateTime<Utc>>,

    /// When the step succeeded or failed.
    pub end_time: Option<DateTime<Utc>>,

    /// Seconds between start and end, never negative.
    pub duration_secs: Option<f64>,

    /// Name of the stage that owns this step, if any.
    pub owner_stage: Option<String>,

    /// Free-form annotations.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ExecutionStep {
    /// Creates a pending step.
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            status: StepStatus::Pending,
            input: None,
            output: None,
            error: None,
            start_time: None,
            end_time: None,
            duration_secs: None,
            owner_stage: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner_stage = Some(owner.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// `pending -> running`, recording the start time and input snapshot.
    pub fn start(&mut self, input: impl Into<String>) -> Result<(), TraceError> {
        self.expect_status(StepStatus::Pending, StepStatus::Running)?;
        self.status = StepStatus::Running;
        self.start_time = Some(Utc::now());
        self.input = Some(input.into());
        Ok(())
    }

    /// `running -> success`, recording output and duration.
    pub fn complete(&mut self, output: impl Into<String>) -> Result<(), TraceError> {
        self.expect_status(StepStatus::Running, StepStatus::Success)?;
        self.status = StepStatus::Success;
        self.output = Some(output.into());
        self.finish();
        Ok(())
    }

    /// `running -> failed`, recording the error and duration.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TraceError> {
        self.expect_status(StepStatus::Running, StepStatus::Failed)?;
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.finish();
        Ok(())
    }

    /// `pending -> skipped`. A skipped step never has timing.
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<(), TraceError> {
        self.expect_status(StepStatus::Pending, StepStatus::Skipped)?;
        self.status = StepStatus::Skipped;
        self.error = Some(reason.into());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.status == StepStatus::Running
    }

    fn finish(&mut self) {
        let end = Utc::now();
        self.end_time = Some(end);
        self.duration_secs = self.start_time.map(|start| elapsed_secs(start, end));
    }

    fn expect_status(&self, expected: StepStatus, to: StepStatus) -> Result<(), TraceError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(TraceError::InvalidTransition {
                name: self.name.clone(),
                from: self.status,
                to,
            })
        }
    }
}

/// Seconds from `start` to `end`, clamped at zero against clock skew.
pub(crate) fn elapsed_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_step_success_lifecycle() {
        let mut step = ExecutionStep::new("generation", StepKind::Agent).with_owner("generation");
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.duration_secs.is_none());

        step.start("seed").unwrap();
        assert!(step.is_running());
        assert!(step.start_time.is_some());
        assert!(step.duration_secs.is_none());

        step.complete("SELECT 1").unwrap();
        assert_eq!(step.status, StepStatus::Success);
        assert_eq!(step.output.as_deref(), Some("SELECT 1"));
        assert!(step.end_time.is_some());
        assert!(step.duration_secs.unwrap() >= 0.0);
    }

    #[test]
    fn test_step_failure_lifecycle() {
        let mut step = ExecutionStep::new("execution", StepKind::Execution);
        step.start("SELECT 1").unwrap();
        step.fail("connection reset").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error.as_deref(), Some("connection reset"));
        assert!(step.duration_secs.unwrap() >= 0.0);
    }

    #[test]
    fn test_unstarted_step_cannot_end() {
        let mut step = ExecutionStep::new("analysis", StepKind::Agent);
        let err = step.complete("x").unwrap_err();
        assert_eq!(
            err,
            TraceError::InvalidTransition {
                name: "analysis".to_string(),
                from: StepStatus::Pending,
                to: StepStatus::Success,
            }
        );
        assert!(step.fail("x").is_err());
        assert!(step.end_time.is_none());
        assert!(step.duration_secs.is_none());
    }

    #[test]
    fn test_finished_step_is_immutable() {
        let mut step = ExecutionStep::new("analysis", StepKind::Agent);
        step.start("q").unwrap();
        step.complete("a").unwrap();
        assert!(step.fail("late").is_err());
        assert!(step.start("again").is_err());
        assert_eq!(step.status, StepStatus::Success);
    }

    #[test]
    fn test_skip_only_from_pending() {
        let mut step = ExecutionStep::new("postprocess", StepKind::Agent);
        step.skip("answer mode disabled").unwrap();
        assert_eq!(step.status, StepStatus::Skipped);
        assert!(step.start_time.is_none());
        assert!(step.duration_secs.is_none());

        let mut running = ExecutionStep::new("execution", StepKind::Execution);
        running.start("SELECT 1").unwrap();
        assert!(running.skip("too late").is_err());
    }

    #[test]
    fn test_elapsed_secs_never_negative() {
        let now = Utc::now();
        assert_eq!(elapsed_secs(now, now - Duration::seconds(5)), 0.0);
        assert!((elapsed_secs(now, now + Duration::milliseconds(1500)) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_step_serializes_lowercase_enums_and_camel_case() {
        let step = ExecutionStep::new("format_schema", StepKind::Schema)
            .with_metadata("dbId", serde_json::json!("concert_singer"));
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["kind"], "schema");
        assert_eq!(json["status"], "pending");
        assert!(json.get("startTime").is_some());
        assert!(json.get("ownerStage").is_some());
        assert_eq!(json["metadata"]["dbId"], "concert_singer");
    }
}
