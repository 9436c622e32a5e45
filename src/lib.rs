//! sqlforge: Multi-stage NL-to-SQL pipeline orchestrator.
//!
//! This library routes a natural-language question through analysis,
//! generation, execution and refinement stages, records every step in an
//! execution trace, and logs terminal failures for offline analysis.

// Core modules
pub mod cli;
pub mod conversation;
pub mod error;
pub mod evaluation;
pub mod failure;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod prompts;
pub mod schema;
pub mod stages;
pub mod trace;
pub mod utils;

// Re-export commonly used error types
pub use error::LlmError;
pub use evaluation::EvaluationError;
pub use pipeline::{OrchestratorError, RunFailure};
pub use schema::SchemaError;
pub use stages::StageError;
pub use trace::{RegistryError, TraceError};
