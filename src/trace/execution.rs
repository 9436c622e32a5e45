//! Per-task execution trace and its structured projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::error::TraceError;
use super::step::{elapsed_secs, ExecutionStep, StepKind, StepStatus};

/// Overall status of a traced task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Pending => "pending",
            TraceStatus::Running => "running",
            TraceStatus::Success => "success",
            TraceStatus::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TraceStatus::Success | TraceStatus::Failed)
    }
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step counts of a trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSummary {
    pub total_steps: usize,
    pub successful_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
}

/// Serializable snapshot of an [`ExecutionTrace`].
///
/// This is the shape returned to status pollers and embedded in failure
/// records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    /// Unique task identifier.
    pub task_id: String,

    /// What the task ran against (a database id).
    pub subject_id: String,

    /// The natural-language question.
    pub input_query: String,

    /// Overall status.
    pub overall_status: TraceStatus,

    /// When the trace was created.
    pub start_time: DateTime<Utc>,

    /// When the trace completed or failed.
    pub end_time: Option<DateTime<Utc>>,

    /// Total seconds, present only once the trace has ended.
    pub duration_secs: Option<f64>,

    /// Index of the most recently added step.
    pub current_step: Option<usize>,

    /// Steps in creation order.
    pub steps: Vec<ExecutionStep>,

    /// Final output on success.
    pub final_result: Option<String>,

    /// Error message on failure.
    pub error: Option<String>,

    /// Step counts.
    pub summary: TraceSummary,

    /// Free-form annotations.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Append-only audit record of one task.
///
/// At most one step runs at a time. Once `complete` or `fail` has been
/// called the trace is frozen and every mutator returns
/// [`TraceError::Frozen`].
#[derive(Debug, Clone)]
pub struct ExecutionTrace {
    task_id: String,
    subject_id: String,
    input_query: String,
    steps: Vec<ExecutionStep>,
    current_step: Option<usize>,
    status: TraceStatus,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    final_result: Option<String>,
    error: Option<String>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl ExecutionTrace {
    pub fn new(
        task_id: impl Into<String>,
        subject_id: impl Into<String>,
        input_query: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            subject_id: subject_id.into(),
            input_query: input_query.into(),
            steps: Vec::new(),
            current_step: None,
            status: TraceStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            final_result: None,
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn input_query(&self) -> &str {
        &self.input_query
    }

    pub fn status(&self) -> TraceStatus {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    pub fn final_result(&self) -> Option<&str> {
        self.final_result.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// The most recently added step.
    pub fn current_step(&self) -> Option<&ExecutionStep> {
        self.current_step.and_then(|i| self.steps.get(i))
    }

    /// The last step that ended in failure.
    pub fn last_failed_step(&self) -> Option<&ExecutionStep> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Failed)
    }

    /// Step the trace was working on when it failed: the current step if it
    /// failed or is still running, else the last failed step.
    pub fn failed_step(&self) -> Option<&ExecutionStep> {
        self.current_step()
            .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::Running))
            .or_else(|| self.last_failed_step())
    }

    /// Number of steps that completed successfully.
    pub fn successful_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Success)
            .count()
    }

    pub fn set_metadata(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), TraceError> {
        self.ensure_open()?;
        self.metadata.insert(key.into(), value);
        Ok(())
    }

    /// Adds and starts a new step, making it current.
    pub fn start_step(
        &mut self,
        name: impl Into<String>,
        kind: StepKind,
        input: impl Into<String>,
    ) -> Result<usize, TraceError> {
        self.start_prepared_step(ExecutionStep::new(name, kind), input)
    }

    /// Adds and starts a step built by the caller (owner, description,
    /// metadata already set).
    pub fn start_prepared_step(
        &mut self,
        mut step: ExecutionStep,
        input: impl Into<String>,
    ) -> Result<usize, TraceError> {
        self.ensure_open()?;
        self.ensure_idle()?;
        step.start(input)?;
        Ok(self.push(step))
    }

    /// Records a step that was deliberately not run.
    pub fn skip_step(
        &mut self,
        name: impl Into<String>,
        kind: StepKind,
        reason: impl Into<String>,
    ) -> Result<usize, TraceError> {
        self.ensure_open()?;
        self.ensure_idle()?;
        let mut step = ExecutionStep::new(name, kind);
        step.skip(reason)?;
        Ok(self.push(step))
    }

    pub fn complete_current_step(&mut self, output: impl Into<String>) -> Result<(), TraceError> {
        self.ensure_open()?;
        self.current_step_mut()?.complete(output)
    }

    pub fn fail_current_step(&mut self, error: impl Into<String>) -> Result<(), TraceError> {
        self.ensure_open()?;
        self.current_step_mut()?.fail(error)
    }

    /// Marks the task successful and freezes the trace.
    pub fn complete(&mut self, final_result: impl Into<String>) -> Result<(), TraceError> {
        self.ensure_open()?;
        self.ensure_idle()?;
        self.final_result = Some(final_result.into());
        self.finish(TraceStatus::Success);
        Ok(())
    }

    /// Marks the task failed and freezes the trace. A running current step
    /// is failed with the same error first.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TraceError> {
        self.ensure_open()?;
        let error = error.into();
        if let Some(step) = self.running_step_mut() {
            step.fail(error.clone())?;
        }
        self.error = Some(error);
        self.finish(TraceStatus::Failed);
        Ok(())
    }

    pub fn summary(&self) -> TraceSummary {
        let count = |status: StepStatus| self.steps.iter().filter(|s| s.status == status).count();
        TraceSummary {
            total_steps: self.steps.len(),
            successful_steps: count(StepStatus::Success),
            failed_steps: count(StepStatus::Failed),
            skipped_steps: count(StepStatus::Skipped),
        }
    }

    /// Projects the trace into its serializable record.
    ///
    /// Reads no clock, so two calls without an intervening mutation produce
    /// identical records.
    pub fn to_record(&self) -> TraceRecord {
        TraceRecord {
            task_id: self.task_id.clone(),
            subject_id: self.subject_id.clone(),
            input_query: self.input_query.clone(),
            overall_status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            duration_secs: self.end_time.map(|end| elapsed_secs(self.start_time, end)),
            current_step: self.current_step,
            steps: self.steps.clone(),
            final_result: self.final_result.clone(),
            error: self.error.clone(),
            summary: self.summary(),
            metadata: self.metadata.clone(),
        }
    }

    fn push(&mut self, step: ExecutionStep) -> usize {
        self.steps.push(step);
        let index = self.steps.len() - 1;
        self.current_step = Some(index);
        if self.status == TraceStatus::Pending {
            self.status = TraceStatus::Running;
        }
        index
    }

    fn finish(&mut self, status: TraceStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }

    fn current_step_mut(&mut self) -> Result<&mut ExecutionStep, TraceError> {
        self.current_step
            .and_then(|i| self.steps.get_mut(i))
            .ok_or(TraceError::NoCurrentStep)
    }

    fn running_step_mut(&mut self) -> Option<&mut ExecutionStep> {
        self.current_step
            .and_then(|i| self.steps.get_mut(i))
            .filter(|s| s.is_running())
    }

    fn ensure_open(&self) -> Result<(), TraceError> {
        if self.status.is_finished() {
            return Err(TraceError::Frozen {
                task_id: self.task_id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), TraceError> {
        match self.current_step() {
            Some(step) if step.is_running() => Err(TraceError::StepInProgress(step.name.clone())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace() -> ExecutionTrace {
        ExecutionTrace::new("task-1", "concert_singer", "How many singers do we have?")
    }

    #[test]
    fn test_new_trace_is_pending() {
        let trace = trace();
        assert_eq!(trace.status(), TraceStatus::Pending);
        assert!(trace.current_step().is_none());
        assert_eq!(trace.summary(), TraceSummary::default());
    }

    #[test]
    fn test_steps_are_ordered_and_current_tracks_last() {
        let mut trace = trace();
        let first = trace.start_step("analysis", StepKind::Agent, "q").unwrap();
        trace.complete_current_step("tables: singer").unwrap();
        let second = trace.start_step("generation", StepKind::Agent, "q").unwrap();

        assert_eq!((first, second), (0, 1));
        assert_eq!(trace.status(), TraceStatus::Running);
        assert_eq!(trace.current_step().map(|s| s.name.as_str()), Some("generation"));
        assert_eq!(trace.successful_steps(), 1);
    }

    #[test]
    fn test_only_one_running_step() {
        let mut trace = trace();
        trace.start_step("analysis", StepKind::Agent, "q").unwrap();
        let err = trace
            .start_step("generation", StepKind::Agent, "q")
            .unwrap_err();
        assert_eq!(err, TraceError::StepInProgress("analysis".to_string()));
        assert_eq!(trace.steps().len(), 1);
    }

    #[test]
    fn test_no_current_step_errors() {
        let mut trace = trace();
        assert_eq!(
            trace.complete_current_step("x").unwrap_err(),
            TraceError::NoCurrentStep
        );
        assert_eq!(
            trace.fail_current_step("x").unwrap_err(),
            TraceError::NoCurrentStep
        );
    }

    #[test]
    fn test_fail_marks_running_step_failed() {
        let mut trace = trace();
        trace.start_step("analysis", StepKind::Agent, "q").unwrap();
        trace.complete_current_step("a").unwrap();
        trace.start_step("generation", StepKind::Agent, "q").unwrap();
        trace.fail("upstream 502").unwrap();

        assert_eq!(trace.status(), TraceStatus::Failed);
        let failed = trace.failed_step().unwrap();
        assert_eq!(failed.name, "generation");
        assert_eq!(failed.status, StepStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("upstream 502"));
        assert_eq!(trace.summary().failed_steps, 1);
        assert_eq!(trace.summary().successful_steps, 1);
    }

    #[test]
    fn test_failed_step_falls_back_to_last_failure() {
        let mut trace = trace();
        trace.start_step("execution", StepKind::Execution, "SELECT").unwrap();
        trace.fail_current_step("locked").unwrap();
        trace.skip_step("postprocess", StepKind::Agent, "not reached").unwrap();

        assert_eq!(trace.failed_step().map(|s| s.name.as_str()), Some("execution"));
    }

    #[test]
    fn test_frozen_after_complete() {
        let mut trace = trace();
        trace.start_step("analysis", StepKind::Agent, "q").unwrap();
        trace.complete_current_step("a").unwrap();
        trace.complete("OK: 3 rows").unwrap();

        assert_eq!(trace.final_result(), Some("OK: 3 rows"));
        assert!(matches!(
            trace.start_step("generation", StepKind::Agent, "q"),
            Err(TraceError::Frozen { .. })
        ));
        assert!(trace.fail("late").is_err());
        assert!(trace.set_metadata("k", serde_json::json!(1)).is_err());
        assert_eq!(trace.status(), TraceStatus::Success);
    }

    #[test]
    fn test_complete_rejects_running_step() {
        let mut trace = trace();
        trace.start_step("analysis", StepKind::Agent, "q").unwrap();
        assert!(matches!(
            trace.complete("done"),
            Err(TraceError::StepInProgress(_))
        ));
        assert!(!trace.is_finished());
    }

    #[test]
    fn test_projection_is_stable() {
        let mut trace = trace();
        trace.set_metadata("mode", serde_json::json!("sql2sql")).unwrap();
        trace.start_step("analysis", StepKind::Agent, "q").unwrap();
        trace.complete_current_step("a").unwrap();

        let first = serde_json::to_string(&trace.to_record()).unwrap();
        let second = serde_json::to_string(&trace.to_record()).unwrap();
        assert_eq!(first, second);

        trace.complete("a").unwrap();
        let first = serde_json::to_string(&trace.to_record()).unwrap();
        let second = serde_json::to_string(&trace.to_record()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_record_shape() {
        let mut trace = trace();
        trace.start_step("analysis", StepKind::Agent, "q").unwrap();
        let open = trace.to_record();
        assert!(open.duration_secs.is_none());
        assert_eq!(open.current_step, Some(0));

        trace.fail("boom").unwrap();
        let json = serde_json::to_value(trace.to_record()).unwrap();
        assert_eq!(json["taskId"], "task-1");
        assert_eq!(json["subjectId"], "concert_singer");
        assert_eq!(json["overallStatus"], "failed");
        assert_eq!(json["summary"]["failedSteps"], 1);
        assert_eq!(json["steps"][0]["status"], "failed");
        assert!(json["durationSecs"].as_f64().unwrap() >= 0.0);

        let back: TraceRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, trace.to_record());
    }
}
