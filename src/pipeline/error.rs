//! Orchestration error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::conversation::DeadEndReason;
use crate::stages::{StageError, StageSetError};
use crate::trace::{RegistryError, TraceError};

/// Classification of a failed run, as written to the failure log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A stage failed to produce output.
    StageInvocationError,
    /// The router found no valid next stage.
    RouterDeadEnd,
    /// The round ceiling was reached without a terminal decision.
    RoundLimitExceeded,
    /// A status query named an unknown task.
    TraceNotFound,
    /// Trace bookkeeping or pipeline assembly failed.
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::StageInvocationError => "StageInvocationError",
            ErrorKind::RouterDeadEnd => "RouterDeadEnd",
            ErrorKind::RoundLimitExceeded => "RoundLimitExceeded",
            ErrorKind::TraceNotFound => "TraceNotFound",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that end a pipeline run or a status query.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Stage '{stage}' failed: {source}")]
    StageInvocation {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("Router dead end after '{last_stage}': {reason}")]
    RouterDeadEnd {
        last_stage: String,
        reason: DeadEndReason,
    },

    #[error("Round limit of {max_rounds} reached without a terminal decision")]
    RoundLimitExceeded { max_rounds: usize },

    #[error("Trace '{0}' not found")]
    TraceNotFound(String),

    #[error("Trace bookkeeping failed: {0}")]
    Trace(#[from] TraceError),

    #[error("Task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("Invalid stage set: {0}")]
    StageSet(#[from] StageSetError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::StageInvocation { .. } => ErrorKind::StageInvocationError,
            OrchestratorError::RouterDeadEnd { .. } => ErrorKind::RouterDeadEnd,
            OrchestratorError::RoundLimitExceeded { .. } => ErrorKind::RoundLimitExceeded,
            OrchestratorError::TraceNotFound(_) => ErrorKind::TraceNotFound,
            OrchestratorError::Trace(_)
            | OrchestratorError::DuplicateTask(_)
            | OrchestratorError::StageSet(_)
            | OrchestratorError::Configuration(_) => ErrorKind::InternalError,
        }
    }

    /// Whether this error ends a run, as opposed to a failed lookup.
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::TraceNotFound
    }
}

impl From<RegistryError> for OrchestratorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(task_id) => OrchestratorError::TraceNotFound(task_id),
            RegistryError::AlreadyRegistered(task_id) => OrchestratorError::DuplicateTask(task_id),
        }
    }
}

/// The error and its chain of sources, one per line.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\ncaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Failure result handed back to the caller of a run.
///
/// Carries enough to look up the full trace by `task_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub task_id: String,
}

impl RunFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            task_id: task_id.into(),
        }
    }

    pub fn from_error(err: &OrchestratorError, task_id: impl Into<String>) -> Self {
        Self::new(err.kind(), err.to_string(), task_id)
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] task {}: {}", self.kind, self.task_id, self.message)
    }
}

impl std::error::Error for RunFailure {}
