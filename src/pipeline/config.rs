//! Pipeline configuration.
//!
//! This module provides configuration options for the NL-to-SQL pipeline,
//! including round limits, LLM options, routing markers, failure-log and
//! trace-retention settings.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::conversation::{RouterConfig, DEFAULT_ERROR_MARKER, DEFAULT_TERMINATION_MARKER};
use crate::failure::DEFAULT_FAILURE_LOG;
use crate::llm::DEFAULT_MODEL;
use crate::stages::StageSet;

/// Largest accepted value for `max_rounds`.
pub const MAX_ROUNDS_CEILING: usize = 50;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the NL-to-SQL pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Conversation settings
    /// Maximum stage invocations per task before the run is abandoned.
    pub max_rounds: usize,
    /// Per-stage invocation timeout. `None` waits indefinitely.
    pub stage_timeout: Option<Duration>,
    /// Cap on refinement attempts per task.
    pub max_refinements: Option<usize>,
    /// Substrings that end the conversation.
    pub termination_markers: Vec<String>,
    /// Substrings that flag an execution failure.
    pub error_markers: Vec<String>,

    // Stage selection
    /// Run generated SQL against the task database.
    pub sql_execution: bool,
    /// Add a post-processing stage that answers in natural language.
    pub answer_mode: bool,
    /// Directory holding `<db_id>/<db_id>.sqlite` databases.
    pub db_root: Option<PathBuf>,

    // LLM settings
    /// Model used by every LLM-backed stage.
    pub model: String,
    /// Temperature for LLM generation.
    pub temperature: f64,

    // Storage settings
    /// JSON Lines file receiving failure records.
    pub failure_log_path: PathBuf,
    /// How long finished traces stay queryable in the registry.
    pub trace_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_rounds: 20,
            stage_timeout: None,
            max_refinements: None,
            termination_markers: vec![DEFAULT_TERMINATION_MARKER.to_string()],
            error_markers: vec![DEFAULT_ERROR_MARKER.to_string()],

            sql_execution: true,
            answer_mode: false,
            db_root: None,

            model: DEFAULT_MODEL.to_string(),
            temperature: 0.0,

            failure_log_path: PathBuf::from(DEFAULT_FAILURE_LOG),
            trace_ttl: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SQLFORGE_MAX_ROUNDS`: Maximum rounds per task (default: 20, at most 50)
    /// - `SQLFORGE_STAGE_TIMEOUT_SECS`: Per-stage timeout, `0` disables (default: none)
    /// - `SQLFORGE_MAX_REFINEMENTS`: Refinement cap per task (default: none)
    /// - `SQLFORGE_TERMINATION_MARKERS`: Comma-separated termination markers (default: TERMINATE)
    /// - `SQLFORGE_ERROR_MARKERS`: Comma-separated error markers (default: ERROR:)
    /// - `SQLFORGE_SQL_EXECUTION`: Execute generated SQL (default: true)
    /// - `SQLFORGE_ANSWER_MODE`: Add the post-processing stage (default: false)
    /// - `SQLFORGE_DB_ROOT`: Database root directory (default: none)
    /// - `SQLFORGE_MODEL`: LLM model (default: openai/gpt-4o-mini)
    /// - `SQLFORGE_TEMPERATURE`: LLM temperature (default: 0.0)
    /// - `SQLFORGE_FAILURE_LOG`: Failure log path (default: logs/error_data.log)
    /// - `SQLFORGE_TRACE_TTL_SECS`: Trace retention in seconds (default: 3600)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if variables have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Conversation settings
        if let Some(val) = lookup("SQLFORGE_MAX_ROUNDS") {
            config.max_rounds = parse_env_value(&val, "SQLFORGE_MAX_ROUNDS")?;
        }

        if let Some(val) = lookup("SQLFORGE_STAGE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "SQLFORGE_STAGE_TIMEOUT_SECS")?;
            config.stage_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(val) = lookup("SQLFORGE_MAX_REFINEMENTS") {
            config.max_refinements = Some(parse_env_value(&val, "SQLFORGE_MAX_REFINEMENTS")?);
        }

        if let Some(val) = lookup("SQLFORGE_TERMINATION_MARKERS") {
            config.termination_markers = parse_env_list(&val);
        }

        if let Some(val) = lookup("SQLFORGE_ERROR_MARKERS") {
            config.error_markers = parse_env_list(&val);
        }

        // Stage selection
        if let Some(val) = lookup("SQLFORGE_SQL_EXECUTION") {
            config.sql_execution = parse_env_bool(&val, "SQLFORGE_SQL_EXECUTION")?;
        }

        if let Some(val) = lookup("SQLFORGE_ANSWER_MODE") {
            config.answer_mode = parse_env_bool(&val, "SQLFORGE_ANSWER_MODE")?;
        }

        if let Some(val) = lookup("SQLFORGE_DB_ROOT") {
            config.db_root = Some(PathBuf::from(val));
        }

        // LLM settings
        if let Some(val) = lookup("SQLFORGE_MODEL") {
            config.model = val;
        }

        if let Some(val) = lookup("SQLFORGE_TEMPERATURE") {
            config.temperature = parse_env_value(&val, "SQLFORGE_TEMPERATURE")?;
        }

        // Storage settings
        if let Some(val) = lookup("SQLFORGE_FAILURE_LOG") {
            config.failure_log_path = PathBuf::from(val);
        }

        if let Some(val) = lookup("SQLFORGE_TRACE_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "SQLFORGE_TRACE_TTL_SECS")?;
            config.trace_ttl = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_ROUNDS_CEILING).contains(&self.max_rounds) {
            return Err(ConfigError::ValidationFailed(format!(
                "max_rounds must be between 1 and {}",
                MAX_ROUNDS_CEILING
            )));
        }

        if self.stage_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "stage_timeout must be greater than 0".to_string(),
            ));
        }

        if self.termination_markers.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "termination_markers cannot be empty".to_string(),
            ));
        }

        if self
            .termination_markers
            .iter()
            .chain(&self.error_markers)
            .any(|m| m.is_empty())
        {
            return Err(ConfigError::ValidationFailed(
                "markers cannot be empty strings".to_string(),
            ));
        }

        if self.model.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "model cannot be empty".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationFailed(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.failure_log_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "failure_log_path cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether the execution stage can be assembled.
    pub fn executes_sql(&self) -> bool {
        self.sql_execution && self.db_root.is_some()
    }

    /// Router configuration enabling the optional roles present in `stages`.
    pub fn router_config(&self, stages: &StageSet) -> RouterConfig {
        RouterConfig::for_roles(stages.roles())
            .with_termination_markers(self.termination_markers.clone())
            .with_error_markers(self.error_markers.clone())
            .with_max_refinements(self.max_refinements)
    }

    /// The marker stages are told to emit when they are done.
    pub fn primary_termination_marker(&self) -> &str {
        self.termination_markers
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_TERMINATION_MARKER)
    }

    /// The marker execution output carries on failure.
    pub fn primary_error_marker(&self) -> &str {
        self.error_markers
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_ERROR_MARKER)
    }

    /// Builder method to set max rounds.
    pub fn with_max_rounds(mut self, max: usize) -> Self {
        self.max_rounds = max;
        self
    }

    /// Builder method to set the per-stage timeout.
    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Builder method to cap refinement attempts.
    pub fn with_max_refinements(mut self, limit: Option<usize>) -> Self {
        self.max_refinements = limit;
        self
    }

    /// Builder method to set termination markers.
    pub fn with_termination_markers(mut self, markers: Vec<String>) -> Self {
        self.termination_markers = markers;
        self
    }

    /// Builder method to set error markers.
    pub fn with_error_markers(mut self, markers: Vec<String>) -> Self {
        self.error_markers = markers;
        self
    }

    /// Builder method to enable or disable SQL execution.
    pub fn with_sql_execution(mut self, enabled: bool) -> Self {
        self.sql_execution = enabled;
        self
    }

    /// Builder method to enable or disable answer mode.
    pub fn with_answer_mode(mut self, enabled: bool) -> Self {
        self.answer_mode = enabled;
        self
    }

    /// Builder method to set the database root.
    pub fn with_db_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.db_root = Some(root.into());
        self
    }

    /// Builder method to set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Builder method to set temperature.
    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    /// Builder method to set the failure log path.
    pub fn with_failure_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.failure_log_path = path.into();
        self
    }

    /// Builder method to set trace retention.
    pub fn with_trace_ttl(mut self, ttl: Duration) -> Self {
        self.trace_ttl = ttl;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

/// Parse a comma-separated list, dropping blank items.
fn parse_env_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
