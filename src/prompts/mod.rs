//! Prompt construction for the NL2SQL stages.
//!
//! - [`build_task_prompt`] renders the seed message of a conversation
//! - [`build_stage_prompt`] renders the system prompt of one role
//!
//! ```no_run
//! use sqlforge::conversation::Role;
//! use sqlforge::prompts::{build_stage_prompt, build_task_prompt, StagePromptContext};
//!
//! let seed = build_task_prompt("concert_singer", "How many singers do we have?", true)?;
//! let ctx = StagePromptContext::new("Table singer: ...", true);
//! let system = build_stage_prompt(Role::Generation, &ctx)?;
//! # Ok::<(), sqlforge::prompts::PromptError>(())
//! ```

pub mod templates;

use tera::{Context, Tera};
use thiserror::Error;

use crate::conversation::{Role, DEFAULT_ERROR_MARKER, DEFAULT_TERMINATION_MARKER};

pub use templates::{
    ANALYSIS_TEMPLATE, GENERATION_TEMPLATE, POSTPROCESS_TEMPLATE, REFINEMENT_TEMPLATE,
    TASK_TEMPLATE,
};

/// Errors that can occur while rendering prompts.
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Tera template rendering error: {0}")]
    Tera(#[from] tera::Error),
}

/// Values available to stage templates.
#[derive(Debug, Clone)]
pub struct StagePromptContext {
    /// Formatted database schema.
    pub schema: String,
    /// Whether generated SQL is executed.
    pub execute: bool,
    /// Marker a stage emits to end the conversation.
    pub termination_marker: String,
    /// Marker that flags an execution failure.
    pub error_marker: String,
}

impl StagePromptContext {
    pub fn new(schema: impl Into<String>, execute: bool) -> Self {
        Self {
            schema: schema.into(),
            execute,
            termination_marker: DEFAULT_TERMINATION_MARKER.to_string(),
            error_marker: DEFAULT_ERROR_MARKER.to_string(),
        }
    }

    pub fn with_markers(
        mut self,
        termination_marker: impl Into<String>,
        error_marker: impl Into<String>,
    ) -> Self {
        self.termination_marker = termination_marker.into();
        self.error_marker = error_marker.into();
        self
    }
}

/// Renders the seed message for a question.
pub fn build_task_prompt(db_id: &str, question: &str, execute: bool) -> Result<String, PromptError> {
    let mut context = Context::new();
    context.insert("db_id", db_id);
    context.insert("question", question);
    context.insert("execute", &execute);
    Ok(Tera::one_off(TASK_TEMPLATE, &context, false)?)
}

/// Renders the system prompt for `role`.
///
/// The execution role is not language-model driven and has no prompt; it
/// renders to an empty string.
pub fn build_stage_prompt(role: Role, ctx: &StagePromptContext) -> Result<String, PromptError> {
    let template = match role {
        Role::Analysis => ANALYSIS_TEMPLATE,
        Role::Generation => GENERATION_TEMPLATE,
        Role::Refinement => REFINEMENT_TEMPLATE,
        Role::Postprocess => POSTPROCESS_TEMPLATE,
        Role::Execution => return Ok(String::new()),
    };

    let mut context = Context::new();
    context.insert("schema", &ctx.schema);
    context.insert("execute", &ctx.execute);
    context.insert("termination_marker", &ctx.termination_marker);
    context.insert("error_marker", &ctx.error_marker);
    Ok(Tera::one_off(template, &context, false)?)
}
