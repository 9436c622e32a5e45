//! Pipeline orchestration for NL-to-SQL conversations.
//!
//! This module runs the stage conversation for a task and records what
//! happened.
//!
//! # Architecture
//!
//! The pipeline consists of several components:
//!
//! - **Driver**: [`ConversationDriver`] runs the route → invoke → record loop
//! - **Service**: [`Nl2SqlService`] assembles a driver per request from the
//!   schema catalog and configuration
//! - **Config**: [`PipelineConfig`] holds round limits, markers and LLM options
//! - **Errors**: [`OrchestratorError`] and the caller-facing [`RunFailure`]
//!
//! # Pipeline Flow
//!
//! 1. **Registration**: A trace is created and registered under the task id
//! 2. **Schema**: The `format_schema` step renders the database schema
//! 3. **Routing**: The router picks the next role from the last message
//! 4. **Invocation**: The stage for that role produces one message
//! 5. **Recording**: Each invocation becomes one trace step
//! 6. **Completion**: A terminal decision completes the trace; any failure
//!    fails it and writes a record to the failure log
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sqlforge::llm::LiteLlmClient;
//! use sqlforge::pipeline::{Nl2SqlService, PipelineConfig, QueryRequest};
//! use sqlforge::schema::SchemaCatalog;
//!
//! let config = PipelineConfig::from_env()?.with_db_root("data/spider/database");
//! let catalog = Arc::new(SchemaCatalog::load("data/spider/tables.json").await?);
//! let provider = Arc::new(LiteLlmClient::from_env()?);
//!
//! let service = Nl2SqlService::new(config, catalog, provider)?;
//! let response = service
//!     .execute(QueryRequest::new("concert_singer", "How many singers do we have?"))
//!     .await?;
//!
//! println!("{} ({} rounds)", response.sql.unwrap_or_default(), response.rounds);
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod service;

pub use config::{ConfigError, PipelineConfig, MAX_ROUNDS_CEILING};
pub use driver::{ConversationDriver, RunSuccess, TaskInput};
pub use error::{error_chain, ErrorKind, OrchestratorError, RunFailure};
pub use service::{Nl2SqlService, QueryRequest, QueryResponse, FORMAT_SCHEMA_STEP};
