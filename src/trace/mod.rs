//! Execution tracing for pipeline runs.
//!
//! Every task owns one [`ExecutionTrace`]: an append-only list of
//! [`ExecutionStep`]s, one per stage invocation or named phase. Traces are
//! shared through the [`TraceRegistry`] so callers can poll a task's status
//! by id while it runs and after it finishes.
//!
//! ```ignore
//! use sqlforge::trace::{ExecutionTrace, StepKind, TraceRegistry};
//!
//! let registry = TraceRegistry::new();
//! let trace = registry.register(ExecutionTrace::new("task-1", "concert_singer", "How many?"))?;
//! trace.write().unwrap().start_step("analysis", StepKind::Agent, "How many?")?;
//! let record = registry.get("task-1")?;
//! ```

pub mod error;
pub mod execution;
pub mod registry;
pub mod step;

pub use error::{RegistryError, TraceError};
pub use execution::{ExecutionTrace, TraceRecord, TraceStatus, TraceSummary};
pub use registry::{share, snapshot, SharedTrace, TraceRegistry};
pub use step::{ExecutionStep, StepKind, StepStatus};
