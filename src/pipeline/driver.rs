//! The conversation driver.
//!
//! Runs the route → invoke → record loop for one task until the router
//! reports a terminal decision or the run fails. Every stage invocation is
//! one round and one trace step; failures fail the trace and reach the
//! failure sink before the caller sees them.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::error::{error_chain, OrchestratorError, RunFailure};
use crate::conversation::{ConversationState, Decision, DeadEndReason, Router, SEED_SENDER};
use crate::failure::FailureSink;
use crate::metrics::{MetricsCollector, OUTCOME_SUCCESS};
use crate::stages::{Capability, Stage, StageError, StageSet};
use crate::trace::{
    share, ExecutionStep, ExecutionTrace, SharedTrace, StepKind, TraceError, TraceRecord,
    TraceRegistry,
};

/// A task submitted to [`ConversationDriver::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInput {
    /// Task id. A random id is assigned when absent.
    pub task_id: Option<String>,
    /// What the task is about, typically the database id.
    pub subject_id: String,
    /// The user's question as asked.
    pub input_query: String,
    /// First message of the conversation.
    pub seed: String,
}

impl TaskInput {
    /// A task whose seed is the question itself.
    pub fn new(subject_id: impl Into<String>, input_query: impl Into<String>) -> Self {
        let input_query = input_query.into();
        Self {
            task_id: None,
            subject_id: subject_id.into(),
            seed: input_query.clone(),
            input_query,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_seed(mut self, seed: impl Into<String>) -> Self {
        self.seed = seed.into();
        self
    }
}

/// Result of a run that reached a terminal decision.
#[derive(Debug, Clone)]
pub struct RunSuccess {
    pub task_id: String,
    /// Content of the last message.
    pub final_content: String,
    /// Stage invocations used.
    pub rounds: usize,
    pub conversation: ConversationState,
    /// Trace projection taken after completion.
    pub trace: TraceRecord,
}

/// Drives one conversation per task over a fixed stage set.
///
/// The driver holds no per-task state, so one instance can serve many
/// concurrent runs.
pub struct ConversationDriver {
    router: Router,
    stages: StageSet,
    max_rounds: usize,
    registry: Option<Arc<TraceRegistry>>,
    failure_sink: Option<Arc<dyn FailureSink>>,
    stage_timeout: Option<Duration>,
    metrics: Option<MetricsCollector>,
}

impl ConversationDriver {
    /// Creates a driver.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Configuration` when `max_rounds` is zero.
    pub fn new(
        router: Router,
        stages: StageSet,
        max_rounds: usize,
    ) -> Result<Self, OrchestratorError> {
        if max_rounds == 0 {
            return Err(OrchestratorError::Configuration(
                "max_rounds must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            router,
            stages,
            max_rounds,
            registry: None,
            failure_sink: None,
            stage_timeout: None,
            metrics: None,
        })
    }

    /// Registers every trace started by [`run`](Self::run) in `registry`.
    pub fn with_registry(mut self, registry: Arc<TraceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.failure_sink = Some(sink);
        self
    }

    /// Bounds each stage invocation. Expiry is a stage invocation failure.
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn max_rounds(&self) -> usize {
        self.max_rounds
    }

    pub fn stages(&self) -> &StageSet {
        &self.stages
    }

    /// Creates, registers and drives the trace for `task`.
    pub async fn run(&self, task: TaskInput) -> Result<RunSuccess, RunFailure> {
        let task_id = task
            .task_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let trace = ExecutionTrace::new(&task_id, task.subject_id, task.input_query);

        let shared = match &self.registry {
            Some(registry) => {
                let shared = registry.register(trace).map_err(|e| {
                    let err = OrchestratorError::from(e);
                    tracing::warn!(task_id = %task_id, error = %err, "Rejected task");
                    RunFailure::from_error(&err, &task_id)
                })?;
                if let Some(metrics) = &self.metrics {
                    metrics.set_traces_registered(registry.len());
                }
                shared
            }
            None => share(trace),
        };

        self.drive(shared, task.seed).await
    }

    /// Drives the conversation on an existing trace, which may already
    /// hold earlier steps.
    pub async fn drive(
        &self,
        trace: SharedTrace,
        seed: impl Into<String>,
    ) -> Result<RunSuccess, RunFailure> {
        let task_id = read_trace(&trace).task_id().to_string();
        let mut conversation = ConversationState::with_seed(seed);

        tracing::info!(
            task_id = %task_id,
            max_rounds = self.max_rounds,
            stages = ?self.stages.names(),
            "Starting conversation"
        );

        let outcome = match self.converse(&trace, &mut conversation).await {
            Ok(final_content) => write_trace(&trace, |t| t.complete(final_content.as_str()))
                .map(|()| final_content)
                .map_err(OrchestratorError::from),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(final_content) => {
                let rounds = conversation.round();
                if let Some(metrics) = &self.metrics {
                    metrics.record_run(OUTCOME_SUCCESS, rounds);
                }
                tracing::info!(task_id = %task_id, rounds = rounds, "Conversation completed");

                Ok(RunSuccess {
                    task_id,
                    final_content,
                    rounds,
                    trace: read_trace(&trace).to_record(),
                    conversation,
                })
            }
            Err(err) => Err(report_failure(
                &trace,
                conversation.round(),
                err,
                self.failure_sink.as_deref(),
                self.metrics.as_ref(),
            )
            .await),
        }
    }

    /// The round loop. Returns the final message content on a terminal
    /// decision.
    async fn converse(
        &self,
        trace: &SharedTrace,
        conversation: &mut ConversationState,
    ) -> Result<String, OrchestratorError> {
        let mut last_stage: Option<String> = None;

        loop {
            let decision = self.router.next(last_stage.as_deref(), conversation);
            tracing::debug!(
                round = conversation.round(),
                last_stage = last_stage.as_deref().unwrap_or(SEED_SENDER),
                decision = ?decision,
                "Routing decision"
            );

            let role = match decision {
                Decision::Terminal => {
                    conversation.mark_terminal();
                    let content = conversation
                        .last()
                        .map(|m| m.content.clone())
                        .unwrap_or_default();
                    return Ok(content);
                }
                Decision::DeadEnd(reason) => {
                    return Err(dead_end(last_stage, reason));
                }
                Decision::NextStage(role) => role,
            };

            if conversation.round() >= self.max_rounds {
                return Err(OrchestratorError::RoundLimitExceeded {
                    max_rounds: self.max_rounds,
                });
            }

            let Some(stage) = self.stages.for_role(role) else {
                return Err(dead_end(last_stage, DeadEndReason::StageNotRegistered(role)));
            };
            let name = stage.name().to_string();

            let kind = if stage.has_capability(Capability::ExecuteSql) {
                StepKind::Execution
            } else {
                StepKind::Agent
            };
            let step = ExecutionStep::new(&name, kind)
                .with_owner(&name)
                .with_metadata("round", serde_json::json!(conversation.round() + 1));
            let input = conversation
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            write_trace(trace, |t| t.start_prepared_step(step, input))?;

            let started = Instant::now();
            let result = self.invoke(stage.as_ref(), conversation).await;
            let elapsed = started.elapsed().as_secs_f64();
            if let Some(metrics) = &self.metrics {
                metrics.record_stage(&name, result.is_ok(), elapsed);
            }

            match result {
                Ok(content) => {
                    write_trace(trace, |t| t.complete_current_step(content.as_str()))?;
                    conversation.append(name.as_str(), content);
                    tracing::info!(
                        stage = %name,
                        round = conversation.round(),
                        duration_secs = elapsed,
                        "Stage completed"
                    );
                    last_stage = Some(name);
                }
                Err(source) => {
                    tracing::warn!(stage = %name, error = %source, "Stage failed");
                    write_trace(trace, |t| t.fail_current_step(source.to_string()))?;
                    return Err(OrchestratorError::StageInvocation {
                        stage: name,
                        source,
                    });
                }
            }
        }
    }

    async fn invoke(
        &self,
        stage: &dyn Stage,
        conversation: &ConversationState,
    ) -> Result<String, StageError> {
        match self.stage_timeout {
            Some(limit) => tokio::time::timeout(limit, stage.invoke(conversation))
                .await
                .map_err(|_| StageError::Timeout(limit))?,
            None => stage.invoke(conversation).await,
        }
    }
}

/// Fails the trace, hands it to the failure sink and builds the
/// caller-facing failure.
pub(crate) async fn report_failure(
    trace: &SharedTrace,
    rounds: usize,
    err: OrchestratorError,
    sink: Option<&dyn FailureSink>,
    metrics: Option<&MetricsCollector>,
) -> RunFailure {
    let kind = err.kind();
    let message = err.to_string();
    let stack_info = error_chain(&err);

    // Snapshot under the lock; the sink is awaited without holding it.
    let snapshot = {
        let mut guard = trace.write().unwrap_or_else(PoisonError::into_inner);
        if !guard.is_finished() {
            if let Err(e) = guard.fail(message.as_str()) {
                tracing::warn!(task_id = %guard.task_id(), error = %e, "Could not fail trace");
            }
        }
        guard.clone()
    };
    let task_id = snapshot.task_id().to_string();

    tracing::error!(
        task_id = %task_id,
        error_kind = %kind,
        rounds = rounds,
        error = %message,
        "Pipeline run failed"
    );

    if err.is_fatal() {
        if let Some(sink) = sink {
            sink.record(&snapshot, kind, &message, Some(&stack_info))
                .await;
        }
        if let Some(metrics) = metrics {
            metrics.record_failure(kind.as_str());
        }
    }
    if let Some(metrics) = metrics {
        metrics.record_run(kind.as_str(), rounds);
    }

    RunFailure::from_error(&err, task_id)
}

fn dead_end(last_stage: Option<String>, reason: DeadEndReason) -> OrchestratorError {
    OrchestratorError::RouterDeadEnd {
        last_stage: last_stage.unwrap_or_else(|| SEED_SENDER.to_string()),
        reason,
    }
}

fn read_trace(trace: &SharedTrace) -> std::sync::RwLockReadGuard<'_, ExecutionTrace> {
    trace.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_trace<T>(
    trace: &SharedTrace,
    f: impl FnOnce(&mut ExecutionTrace) -> Result<T, TraceError>,
) -> Result<T, TraceError> {
    let mut guard = trace.write().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Role, RouterConfig};
    use crate::failure::MemoryFailureSink;
    use crate::pipeline::error::ErrorKind;
    use crate::trace::{StepStatus, TraceStatus};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies from a fixed script, then repeats the last reply.
    struct Scripted {
        name: &'static str,
        replies: Mutex<VecDeque<Result<String, String>>>,
        capabilities: Vec<Capability>,
    }

    impl Scripted {
        fn new(name: &'static str, replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name,
                replies: Mutex::new(replies.iter().map(|r| Ok(r.to_string())).collect()),
                capabilities: if name == "execution" {
                    vec![Capability::ExecuteSql]
                } else {
                    Vec::new()
                },
            })
        }

        fn failing(name: &'static str, error: &str) -> Arc<Self> {
            Arc::new(Self {
                name,
                replies: Mutex::new(VecDeque::from([Err(error.to_string())])),
                capabilities: Vec::new(),
            })
        }
    }

    #[async_trait]
    impl Stage for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> &[Capability] {
            &self.capabilities
        }

        async fn invoke(&self, _conversation: &ConversationState) -> Result<String, StageError> {
            let mut replies = self.replies.lock().unwrap();
            let reply = if replies.len() > 1 {
                replies.pop_front()
            } else {
                replies.front().cloned()
            };
            match reply {
                Some(Ok(content)) => Ok(content),
                Some(Err(message)) => Err(StageError::Execution(message)),
                None => Err(StageError::EmptyResponse),
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl Stage for Slow {
        fn name(&self) -> &str {
            "analysis"
        }

        async fn invoke(&self, _conversation: &ConversationState) -> Result<String, StageError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("too late".to_string())
        }
    }

    fn stage_set(stages: Vec<Arc<dyn Stage>>) -> StageSet {
        let mut set = StageSet::new();
        for stage in stages {
            set.insert(stage).unwrap();
        }
        set
    }

    fn driver(stages: Vec<Arc<dyn Stage>>, max_rounds: usize) -> ConversationDriver {
        let stages = stage_set(stages);
        let router = Router::new(RouterConfig::for_roles(stages.roles()));
        ConversationDriver::new(router, stages, max_rounds).unwrap()
    }

    #[test]
    fn test_rejects_zero_rounds() {
        let result = ConversationDriver::new(Router::default(), StageSet::new(), 0);
        assert!(matches!(result, Err(OrchestratorError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_two_stage_run_succeeds() {
        let driver = driver(
            vec![
                Scripted::new("analysis", &["tables: singer"]),
                Scripted::new("generation", &["SELECT count(*) FROM singer"]),
            ],
            10,
        );

        let success = driver
            .run(TaskInput::new("concert_singer", "How many singers?").with_task_id("t-1"))
            .await
            .unwrap();

        assert_eq!(success.task_id, "t-1");
        assert_eq!(success.final_content, "SELECT count(*) FROM singer");
        assert_eq!(success.rounds, 2);
        assert_eq!(success.conversation.len(), 3);
        assert!(success.conversation.is_terminal());
        assert_eq!(success.trace.overall_status, TraceStatus::Success);
        assert_eq!(success.trace.steps.len(), 2);
        assert_eq!(success.trace.steps[0].owner_stage.as_deref(), Some("analysis"));
    }

    #[tokio::test]
    async fn test_assigns_task_id_when_absent() {
        let driver = driver(
            vec![
                Scripted::new("analysis", &["a"]),
                Scripted::new("generation", &["g"]),
            ],
            10,
        );
        let success = driver.run(TaskInput::new("db", "q")).await.unwrap();
        assert!(Uuid::parse_str(&success.task_id).is_ok());
    }

    #[tokio::test]
    async fn test_execution_step_kind() {
        let driver = driver(
            vec![
                Scripted::new("analysis", &["a"]),
                Scripted::new("generation", &["SELECT 1"]),
                Scripted::new("execution", &["OK: 1 row(s)"]),
            ],
            10,
        );
        let success = driver.run(TaskInput::new("db", "q")).await.unwrap();
        let kinds: Vec<StepKind> = success.trace.steps.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![StepKind::Agent, StepKind::Agent, StepKind::Execution]
        );
    }

    #[tokio::test]
    async fn test_stage_failure_is_recorded() {
        let sink = Arc::new(MemoryFailureSink::new());
        let driver = driver(
            vec![
                Scripted::new("analysis", &["a"]),
                Scripted::failing("generation", "rate limited"),
            ],
            10,
        )
        .with_failure_sink(sink.clone());

        let failure = driver
            .run(TaskInput::new("db", "q").with_task_id("t-fail"))
            .await
            .unwrap_err();

        assert_eq!(failure.kind, ErrorKind::StageInvocationError);
        assert_eq!(failure.task_id, "t-fail");

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].failed_step_name, "generation");
        assert!(records[0]
            .stack_info
            .as_deref()
            .unwrap_or_default()
            .contains("rate limited"));
        let steps = &records[0].full_trace_snapshot.steps;
        assert_eq!(steps[1].status, StepStatus::Failed);
        assert_eq!(
            records[0].full_trace_snapshot.overall_status,
            TraceStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_missing_stage_is_dead_end() {
        let stages = stage_set(vec![Scripted::new("analysis", &["a"])]);
        let driver = ConversationDriver::new(Router::default(), stages, 10).unwrap();

        let failure = driver.run(TaskInput::new("db", "q")).await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::RouterDeadEnd);
        assert!(failure.message.contains("generation"));
    }

    #[tokio::test]
    async fn test_round_limit() {
        let driver = driver(
            vec![
                Scripted::new("analysis", &["a"]),
                Scripted::new("generation", &["SELECT 1"]),
                Scripted::new("execution", &["ERROR: no such table"]),
                Scripted::new("refinement", &["try again"]),
            ],
            5,
        );

        let failure = driver.run(TaskInput::new("db", "q")).await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::RoundLimitExceeded);
    }

    #[tokio::test]
    async fn test_stage_timeout() {
        let driver = driver(
            vec![Arc::new(Slow), Scripted::new("generation", &["g"])],
            10,
        )
        .with_stage_timeout(Duration::from_millis(20));

        let failure = driver.run(TaskInput::new("db", "q")).await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::StageInvocationError);
        assert!(failure.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicate_task() {
        let registry = Arc::new(TraceRegistry::new());
        let sink = Arc::new(MemoryFailureSink::new());
        let driver = driver(
            vec![
                Scripted::new("analysis", &["a"]),
                Scripted::new("generation", &["g"]),
            ],
            10,
        )
        .with_registry(registry.clone())
        .with_failure_sink(sink.clone());

        driver
            .run(TaskInput::new("db", "q").with_task_id("dup"))
            .await
            .unwrap();
        let failure = driver
            .run(TaskInput::new("db", "q").with_task_id("dup"))
            .await
            .unwrap_err();

        assert_eq!(failure.kind, ErrorKind::InternalError);
        assert!(sink.is_empty());
        assert_eq!(
            registry.get("dup").unwrap().overall_status,
            TraceStatus::Success
        );
    }

    #[tokio::test]
    async fn test_drive_appends_to_existing_trace() {
        let driver = driver(
            vec![
                Scripted::new("analysis", &["a"]),
                Scripted::new("generation", &["g"]),
            ],
            10,
        );
        let trace = share(ExecutionTrace::new("t-2", "db", "q"));
        trace
            .write()
            .unwrap()
            .start_step("format_schema", StepKind::Schema, "db")
            .unwrap();
        trace
            .write()
            .unwrap()
            .complete_current_step("CREATE TABLE ...")
            .unwrap();

        let success = driver.drive(trace.clone(), "seed").await.unwrap();
        assert_eq!(success.rounds, 2);
        assert_eq!(success.trace.steps.len(), 3);
        assert_eq!(success.trace.steps[0].kind, StepKind::Schema);
        assert_eq!(success.trace.summary.successful_steps, 3);
        assert_eq!(Role::from_stage_name(&success.trace.steps[2].name), Some(Role::Generation));
    }
}
