//! Error types for trace lifecycle and registry operations.

use thiserror::Error;

use super::step::StepStatus;
use super::execution::TraceStatus;

/// Errors raised when a trace or step is driven through an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    #[error("Step '{name}' cannot move from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("Trace has no current step")]
    NoCurrentStep,

    #[error("Step '{0}' is still running")]
    StepInProgress(String),

    #[error("Trace '{task_id}' is frozen with status {status}")]
    Frozen { task_id: String, status: TraceStatus },
}

/// Errors raised by the trace registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Trace '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Trace '{0}' not found")]
    NotFound(String),
}
