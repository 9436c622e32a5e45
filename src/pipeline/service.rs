//! NL-to-SQL service.
//!
//! Assembles a pipeline per request: records the `format_schema` phase,
//! renders the seed and stage prompts, builds the stage set the
//! configuration asks for and hands the trace to a [`ConversationDriver`].

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::config::{ConfigError, PipelineConfig, MAX_ROUNDS_CEILING};
use super::driver::{report_failure, ConversationDriver, RunSuccess};
use super::error::{OrchestratorError, RunFailure};
use crate::conversation::{Role, Router};
use crate::failure::{FailureSink, JsonlFailureSink};
use crate::llm::LlmProvider;
use crate::metrics::MetricsCollector;
use crate::prompts::{build_stage_prompt, build_task_prompt, StagePromptContext};
use crate::schema::{database_path, SchemaCatalog};
use crate::stages::{LlmStage, SqliteExecutionStage, StageError, StageSet};
use crate::trace::{ExecutionTrace, SharedTrace, StepKind, TraceRecord, TraceRegistry};
use crate::utils::extract_sql_from_response;

/// Name of the schema phase step.
pub const FORMAT_SCHEMA_STEP: &str = "format_schema";

/// One question against one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub db_id: String,
    pub nl_query: String,
    /// Overrides the configured round ceiling.
    pub max_rounds: Option<usize>,
    pub task_id: Option<String>,
}

impl QueryRequest {
    pub fn new(db_id: impl Into<String>, nl_query: impl Into<String>) -> Self {
        Self {
            db_id: db_id.into(),
            nl_query: nl_query.into(),
            max_rounds: None,
            task_id: None,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = Some(max_rounds);
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Outcome of a successful request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub task_id: String,
    /// SQL extracted from the last generation message.
    pub sql: Option<String>,
    /// Natural-language answer, in answer mode.
    pub answer: Option<String>,
    pub final_content: String,
    pub rounds: usize,
    pub trace: TraceRecord,
}

impl QueryResponse {
    fn from_success(success: RunSuccess) -> Self {
        let sql = success
            .conversation
            .messages()
            .iter()
            .rev()
            .find(|m| m.sender == Role::Generation.as_str())
            .and_then(|m| extract_sql_from_response(&m.content));
        let answer = (success.conversation.last_sender() == Some(Role::Postprocess.as_str()))
            .then(|| success.final_content.clone());

        Self {
            task_id: success.task_id,
            sql,
            answer,
            final_content: success.final_content,
            rounds: success.rounds,
            trace: success.trace,
        }
    }
}

/// Runs NL-to-SQL requests against a schema catalog.
pub struct Nl2SqlService {
    config: PipelineConfig,
    catalog: Arc<SchemaCatalog>,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<TraceRegistry>,
    failure_sink: Arc<dyn FailureSink>,
    metrics: MetricsCollector,
}

impl Nl2SqlService {
    /// Creates a service writing failures to the configured log.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration does not validate.
    pub fn new(
        config: PipelineConfig,
        catalog: Arc<SchemaCatalog>,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let failure_sink = Arc::new(JsonlFailureSink::new(&config.failure_log_path));

        Ok(Self {
            config,
            catalog,
            provider,
            registry: Arc::new(TraceRegistry::new()),
            failure_sink,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn with_registry(mut self, registry: Arc<TraceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.failure_sink = sink;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TraceRegistry> {
        &self.registry
    }

    /// Current record of a task.
    pub fn trace(&self, task_id: &str) -> Result<TraceRecord, OrchestratorError> {
        Ok(self.registry.get(task_id)?)
    }

    /// Answers one question.
    pub async fn execute(&self, request: QueryRequest) -> Result<QueryResponse, RunFailure> {
        let task_id = request
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let evicted = self.registry.evict_expired(self.config.trace_ttl);
        if evicted > 0 {
            tracing::debug!(evicted = evicted, "Evicted expired traces");
        }

        let max_rounds = request.max_rounds.unwrap_or(self.config.max_rounds);
        if !(1..=MAX_ROUNDS_CEILING).contains(&max_rounds) {
            let err = OrchestratorError::Configuration(format!(
                "max_rounds must be between 1 and {}",
                MAX_ROUNDS_CEILING
            ));
            return Err(RunFailure::from_error(&err, task_id));
        }

        let mut trace = ExecutionTrace::new(&task_id, &request.db_id, &request.nl_query);
        let metadata = [
            ("model", serde_json::json!(self.config.model)),
            ("maxRounds", serde_json::json!(max_rounds)),
            ("executeSql", serde_json::json!(self.config.executes_sql())),
            ("answerMode", serde_json::json!(self.config.answer_mode)),
        ];
        for (key, value) in metadata {
            trace
                .set_metadata(key, value)
                .map_err(|e| RunFailure::from_error(&e.into(), &task_id))?;
        }

        let shared = self
            .registry
            .register(trace)
            .map_err(|e| RunFailure::from_error(&e.into(), &task_id))?;
        self.metrics.set_traces_registered(self.registry.len());

        tracing::info!(
            task_id = %task_id,
            db_id = %request.db_id,
            "Received NL2SQL request"
        );

        let prepared = self.prepare(&shared, &request, max_rounds);
        let (driver, seed) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                return Err(report_failure(
                    &shared,
                    0,
                    err,
                    Some(self.failure_sink.as_ref()),
                    Some(&self.metrics),
                )
                .await);
            }
        };

        driver
            .drive(shared, seed)
            .await
            .map(QueryResponse::from_success)
    }

    /// Runs the schema phase and assembles the driver and seed message.
    fn prepare(
        &self,
        trace: &SharedTrace,
        request: &QueryRequest,
        max_rounds: usize,
    ) -> Result<(ConversationDriver, String), OrchestratorError> {
        let schema = self.format_schema(trace, &request.db_id)?;

        let execute = self.config.executes_sql();
        let seed = build_task_prompt(&request.db_id, &request.nl_query, execute)
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
        let stages = self.build_stages(&request.db_id, schema, execute)?;
        let router = Router::new(self.config.router_config(&stages));

        let mut driver = ConversationDriver::new(router, stages, max_rounds)?
            .with_failure_sink(Arc::clone(&self.failure_sink))
            .with_metrics(self.metrics.clone());
        if let Some(timeout) = self.config.stage_timeout {
            driver = driver.with_stage_timeout(timeout);
        }

        Ok((driver, seed))
    }

    /// The `format_schema` phase, recorded as a schema step.
    fn format_schema(&self, trace: &SharedTrace, db_id: &str) -> Result<String, OrchestratorError> {
        let mut guard = trace.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.start_step(FORMAT_SCHEMA_STEP, StepKind::Schema, db_id)?;

        match self.catalog.format_for_prompt(db_id) {
            Ok(schema) => {
                guard.complete_current_step(schema.as_str())?;
                tracing::debug!(db_id = %db_id, chars = schema.len(), "Formatted schema");
                Ok(schema)
            }
            Err(e) => {
                guard.fail_current_step(e.to_string())?;
                Err(OrchestratorError::StageInvocation {
                    stage: FORMAT_SCHEMA_STEP.to_string(),
                    source: StageError::from(e),
                })
            }
        }
    }

    fn build_stages(
        &self,
        db_id: &str,
        schema: String,
        execute: bool,
    ) -> Result<StageSet, OrchestratorError> {
        let ctx = StagePromptContext::new(schema, execute).with_markers(
            self.config.primary_termination_marker(),
            self.config.primary_error_marker(),
        );

        let mut roles = vec![Role::Analysis, Role::Generation, Role::Refinement];
        if self.config.answer_mode {
            roles.push(Role::Postprocess);
        }

        let mut stages = StageSet::new();
        for role in roles {
            let prompt = build_stage_prompt(role, &ctx)
                .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;
            let stage = LlmStage::new(role, prompt, Arc::clone(&self.provider))
                .with_model(self.config.model.as_str())
                .with_temperature(self.config.temperature);
            stages.insert(Arc::new(stage))?;
        }

        if execute {
            if let Some(db_root) = &self.config.db_root {
                let db_path = database_path(db_root, db_id);
                stages.insert(Arc::new(SqliteExecutionStage::new(db_path)))?;
            }
        }

        Ok(stages)
    }
}
