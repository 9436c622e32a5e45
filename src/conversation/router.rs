//! Stage routing state machine.
//!
//! [`Router::next`] is a pure function of the last speaker and the
//! conversation so far. Routing depends on two inputs only: which optional
//! roles the pipeline enables, and whether the last message carries an
//! error marker. Both are resolved into typed values before the transition
//! table is consulted.

use std::fmt;

use super::types::{ConversationState, Role};

/// Default marker that ends a conversation when a stage emits it.
pub const DEFAULT_TERMINATION_MARKER: &str = "TERMINATE";

/// Default marker that the execution stage prefixes failures with.
pub const DEFAULT_ERROR_MARKER: &str = "ERROR:";

/// Outcome of a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Invoke the stage playing this role next.
    NextStage(Role),
    /// The conversation is complete.
    Terminal,
    /// No valid next stage exists under the current configuration.
    DeadEnd(DeadEndReason),
}

/// Why routing could not continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadEndReason {
    /// Execution reported an error and no refinement stage is enabled.
    ExecutionFailedWithoutRefinement,
    /// Execution reported an error and the refinement budget is spent.
    RefinementLimitReached { limit: usize },
    /// The router chose a role that has no registered stage.
    StageNotRegistered(Role),
}

impl fmt::Display for DeadEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadEndReason::ExecutionFailedWithoutRefinement => {
                write!(f, "execution reported an error and no refinement stage is configured")
            }
            DeadEndReason::RefinementLimitReached { limit } => {
                write!(f, "execution still failing after {} refinement attempt(s)", limit)
            }
            DeadEndReason::StageNotRegistered(role) => {
                write!(f, "no stage registered for role '{}'", role)
            }
        }
    }
}

/// Static routing configuration supplied by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Route generated SQL to an execution stage.
    pub execution_enabled: bool,
    /// Route execution errors (or unexecuted SQL) to a refinement stage.
    pub refinement_enabled: bool,
    /// Route successful execution output to a post-processing stage.
    pub postprocess_enabled: bool,
    /// Substrings that end the conversation when found in the last message.
    pub termination_markers: Vec<String>,
    /// Substrings that flag the last message as an execution failure.
    pub error_markers: Vec<String>,
    /// Cap on refinement attempts per task. `None` leaves only the round
    /// ceiling in charge.
    pub max_refinements: Option<usize>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            execution_enabled: true,
            refinement_enabled: true,
            postprocess_enabled: false,
            termination_markers: vec![DEFAULT_TERMINATION_MARKER.to_string()],
            error_markers: vec![DEFAULT_ERROR_MARKER.to_string()],
            max_refinements: None,
        }
    }
}

impl RouterConfig {
    /// Configuration enabling exactly the optional roles in `roles`.
    pub fn for_roles(roles: impl IntoIterator<Item = Role>) -> Self {
        let mut config = Self {
            execution_enabled: false,
            refinement_enabled: false,
            postprocess_enabled: false,
            ..Self::default()
        };
        for role in roles {
            match role {
                Role::Execution => config.execution_enabled = true,
                Role::Refinement => config.refinement_enabled = true,
                Role::Postprocess => config.postprocess_enabled = true,
                Role::Analysis | Role::Generation => {}
            }
        }
        config
    }

    pub fn with_execution(mut self, enabled: bool) -> Self {
        self.execution_enabled = enabled;
        self
    }

    pub fn with_refinement(mut self, enabled: bool) -> Self {
        self.refinement_enabled = enabled;
        self
    }

    pub fn with_postprocess(mut self, enabled: bool) -> Self {
        self.postprocess_enabled = enabled;
        self
    }

    pub fn with_termination_markers(mut self, markers: Vec<String>) -> Self {
        self.termination_markers = markers;
        self
    }

    pub fn with_error_markers(mut self, markers: Vec<String>) -> Self {
        self.error_markers = markers;
        self
    }

    pub fn with_max_refinements(mut self, limit: Option<usize>) -> Self {
        self.max_refinements = limit;
        self
    }

    /// Whether the given role is enabled. Mandatory roles always are.
    pub fn is_enabled(&self, role: Role) -> bool {
        match role {
            Role::Analysis | Role::Generation => true,
            Role::Execution => self.execution_enabled,
            Role::Refinement => self.refinement_enabled,
            Role::Postprocess => self.postprocess_enabled,
        }
    }
}

/// Content signals extracted from the last message, once per decision.
#[derive(Debug, Clone, Copy, Default)]
struct Signals {
    terminated: bool,
    error_detected: bool,
}

/// Pure routing function over a fixed five-role topology.
#[derive(Debug, Clone, Default)]
pub struct Router {
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Decides what happens after `last_stage` spoke.
    ///
    /// `last_stage` is `None` before any stage has run. Unknown stage names
    /// route back to analysis.
    pub fn next(&self, last_stage: Option<&str>, conversation: &ConversationState) -> Decision {
        if conversation.len() <= 1 {
            return Decision::NextStage(Role::Analysis);
        }

        let signals = self.signals(conversation);
        if signals.terminated {
            return Decision::Terminal;
        }

        match last_stage.and_then(Role::from_stage_name) {
            Some(role) => self.transition(role, signals, conversation),
            None => Decision::NextStage(Role::Analysis),
        }
    }

    fn signals(&self, conversation: &ConversationState) -> Signals {
        let Some(last) = conversation.last() else {
            return Signals::default();
        };
        Signals {
            terminated: contains_any(&last.content, &self.config.termination_markers),
            error_detected: contains_any(&last.content, &self.config.error_markers),
        }
    }

    fn transition(
        &self,
        role: Role,
        signals: Signals,
        conversation: &ConversationState,
    ) -> Decision {
        match role {
            Role::Analysis => Decision::NextStage(Role::Generation),
            Role::Generation => self.after_generation(),
            Role::Execution if signals.error_detected => self.after_failed_execution(conversation),
            Role::Execution => self.first_enabled(&[Role::Postprocess]),
            Role::Refinement => Decision::NextStage(Role::Generation),
            Role::Postprocess => Decision::Terminal,
        }
    }

    fn after_generation(&self) -> Decision {
        self.first_enabled(&[Role::Execution, Role::Refinement])
    }

    fn after_failed_execution(&self, conversation: &ConversationState) -> Decision {
        if !self.config.refinement_enabled {
            return Decision::DeadEnd(DeadEndReason::ExecutionFailedWithoutRefinement);
        }
        if let Some(limit) = self.config.max_refinements {
            if conversation.count_from(Role::Refinement.as_str()) >= limit {
                return Decision::DeadEnd(DeadEndReason::RefinementLimitReached { limit });
            }
        }
        Decision::NextStage(Role::Refinement)
    }

    /// First enabled role among `candidates`, or `Terminal` if none is.
    fn first_enabled(&self, candidates: &[Role]) -> Decision {
        candidates
            .iter()
            .copied()
            .find(|role| self.config.is_enabled(*role))
            .map(Decision::NextStage)
            .unwrap_or(Decision::Terminal)
    }
}

fn contains_any(content: &str, markers: &[String]) -> bool {
    markers
        .iter()
        .any(|marker| !marker.is_empty() && content.contains(marker.as_str()))
}
