//! Pipeline stages.
//!
//! A stage is a named unit that reads the conversation so far and produces
//! one message. The orchestrator only sees the [`Stage`] trait; concrete
//! stages call a language model ([`LlmStage`]) or run SQL
//! ([`SqliteExecutionStage`]).

pub mod llm_stage;
pub mod sql_executor;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::conversation::{ConversationState, Role};
use crate::error::LlmError;

pub use llm_stage::LlmStage;
pub use sql_executor::SqliteExecutionStage;

/// Errors a stage invocation can fail with.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("LLM request failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Stage timed out after {0:?}")]
    Timeout(Duration),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Stage returned an empty response")]
    EmptyResponse,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Schema error: {0}")]
    Schema(#[from] crate::schema::SchemaError),
}

/// Capability tags advertised by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Runs SQL against a database.
    ExecuteSql,
    /// Diagnoses failures and suggests fixes.
    Refine,
    /// May produce the final message of a conversation.
    TerminalCandidate,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ExecuteSql => "can-execute-sql",
            Capability::Refine => "can-refine",
            Capability::TerminalCandidate => "terminal-candidate",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, invocable pipeline unit.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Unique name within a pipeline. Canonical role names are routable.
    fn name(&self) -> &str;

    /// Capability tags of this stage.
    fn capabilities(&self) -> &[Capability] {
        &[]
    }

    /// Produces the next message from the conversation so far.
    async fn invoke(&self, conversation: &ConversationState) -> Result<String, StageError>;

    fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

/// Errors raised while assembling a [`StageSet`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageSetError {
    #[error("Stage '{0}' is already registered")]
    Duplicate(String),

    #[error("Stage name cannot be empty")]
    EmptyName,
}

/// The stages available to one pipeline run, keyed by unique name.
#[derive(Clone, Default)]
pub struct StageSet {
    stages: BTreeMap<String, Arc<dyn Stage>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stage. Names must be unique and non-empty.
    pub fn insert(&mut self, stage: Arc<dyn Stage>) -> Result<(), StageSetError> {
        let name = stage.name().to_string();
        if name.is_empty() {
            return Err(StageSetError::EmptyName);
        }
        if self.stages.contains_key(&name) {
            return Err(StageSetError::Duplicate(name));
        }
        self.stages.insert(name, stage);
        Ok(())
    }

    /// Builder form of [`StageSet::insert`].
    pub fn with(mut self, stage: Arc<dyn Stage>) -> Result<Self, StageSetError> {
        self.insert(stage)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Stage>> {
        self.stages.get(name)
    }

    /// The stage registered under `role`'s canonical name.
    pub fn for_role(&self, role: Role) -> Option<&Arc<dyn Stage>> {
        self.get(role.as_str())
    }

    /// Roles that have a registered stage, in pipeline order.
    pub fn roles(&self) -> Vec<Role> {
        Role::ALL
            .into_iter()
            .filter(|role| self.stages.contains_key(role.as_str()))
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.keys().map(String::as_str).collect()
    }

    /// Names of stages advertising `capability`.
    pub fn with_capability(&self, capability: Capability) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|(_, stage)| stage.has_capability(capability))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl fmt::Debug for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSet")
            .field("stages", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        name: &'static str,
        caps: &'static [Capability],
    }

    #[async_trait]
    impl Stage for Echo {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> &[Capability] {
            self.caps
        }

        async fn invoke(&self, conversation: &ConversationState) -> Result<String, StageError> {
            Ok(conversation
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default())
        }
    }

    fn echo(name: &'static str) -> Arc<dyn Stage> {
        Arc::new(Echo { name, caps: &[] })
    }

    #[test]
    fn test_stage_set_rejects_duplicates() {
        let mut set = StageSet::new();
        set.insert(echo("analysis")).unwrap();
        assert_eq!(
            set.insert(echo("analysis")).unwrap_err(),
            StageSetError::Duplicate("analysis".to_string())
        );
        assert_eq!(set.insert(echo("")).unwrap_err(), StageSetError::EmptyName);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_roles_in_pipeline_order() {
        let set = StageSet::new()
            .with(echo("execution"))
            .and_then(|s| s.with(echo("analysis")))
            .and_then(|s| s.with(echo("custom_reviewer")))
            .and_then(|s| s.with(echo("generation")))
            .unwrap();

        assert_eq!(
            set.roles(),
            vec![Role::Analysis, Role::Generation, Role::Execution]
        );
        assert!(set.for_role(Role::Execution).is_some());
        assert!(set.for_role(Role::Refinement).is_none());
        assert_eq!(set.names().len(), 4);
    }

    #[test]
    fn test_capabilities() {
        let set = StageSet::new()
            .with(Arc::new(Echo {
                name: "execution",
                caps: &[Capability::ExecuteSql],
            }))
            .and_then(|s| {
                s.with(Arc::new(Echo {
                    name: "refinement",
                    caps: &[Capability::Refine],
                }))
            })
            .unwrap();

        assert_eq!(set.with_capability(Capability::ExecuteSql), vec!["execution"]);
        assert_eq!(set.with_capability(Capability::Refine), vec!["refinement"]);
        assert!(set.with_capability(Capability::TerminalCandidate).is_empty());
        assert_eq!(Capability::ExecuteSql.to_string(), "can-execute-sql");
    }

    #[tokio::test]
    async fn test_invoke_through_trait_object() {
        let stage = echo("analysis");
        let conv = ConversationState::with_seed("hello");
        assert_eq!(stage.invoke(&conv).await.unwrap(), "hello");
    }
}
