//! Conversation data model: roles, messages and the append-only state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sender name of the seed message that opens every conversation.
pub const SEED_SENDER: &str = "user";

/// The fixed set of pipeline roles a stage can play.
///
/// Each role has a canonical stage name. A stage whose name is not one of
/// these is never routed to directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Reads the question and schema, identifies tables and conditions.
    Analysis,
    /// Writes the SQL statement.
    Generation,
    /// Runs the SQL against a database.
    Execution,
    /// Diagnoses an execution error and suggests a fix.
    Refinement,
    /// Turns execution results into a final answer.
    Postprocess,
}

impl Role {
    /// Every role, in pipeline order.
    pub const ALL: [Role; 5] = [
        Role::Analysis,
        Role::Generation,
        Role::Execution,
        Role::Refinement,
        Role::Postprocess,
    ];

    /// Canonical stage name for this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Analysis => "analysis",
            Role::Generation => "generation",
            Role::Execution => "execution",
            Role::Refinement => "refinement",
            Role::Postprocess => "postprocess",
        }
    }

    /// Resolves a stage name to its role by exact match.
    pub fn from_stage_name(name: &str) -> Option<Role> {
        Role::ALL.into_iter().find(|role| role.as_str() == name)
    }

    /// Whether the pipeline can run without a stage for this role.
    pub fn is_optional(&self) -> bool {
        matches!(self, Role::Execution | Role::Refinement | Role::Postprocess)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message in a conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Name of the stage (or `user`) that produced the message.
    pub sender: String,
    /// Produced text.
    pub content: String,
    /// Position in the conversation, starting at 0 for the seed.
    pub index: usize,
}

/// Ordered, append-only message log of a single task.
///
/// The seed message does not count as a round; every appended stage output
/// does. Consequently `len() >= round()` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    messages: Vec<Message>,
    round: usize,
    terminal: bool,
}

impl ConversationState {
    /// Creates an empty conversation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a conversation holding only the seed message.
    pub fn with_seed(content: impl Into<String>) -> Self {
        Self {
            messages: vec![Message {
                sender: SEED_SENDER.to_string(),
                content: content.into(),
                index: 0,
            }],
            round: 0,
            terminal: false,
        }
    }

    /// Appends a stage output and advances the round counter by one.
    pub fn append(&mut self, sender: impl Into<String>, content: impl Into<String>) -> &Message {
        let index = self.messages.len();
        self.messages.push(Message {
            sender: sender.into(),
            content: content.into(),
            index,
        });
        self.round += 1;
        &self.messages[index]
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Name of whoever spoke last, if anyone.
    pub fn last_sender(&self) -> Option<&str> {
        self.last().map(|m| m.sender.as_str())
    }

    /// The seed message, if the conversation was seeded.
    pub fn seed(&self) -> Option<&Message> {
        self.messages
            .first()
            .filter(|m| m.sender == SEED_SENDER && m.index == 0)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of accepted stage outputs.
    pub fn round(&self) -> usize {
        self.round
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn mark_terminal(&mut self) {
        self.terminal = true;
    }

    /// Number of messages sent by the given stage.
    pub fn count_from(&self, sender: &str) -> usize {
        self.messages.iter().filter(|m| m.sender == sender).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names_round_trip() {
        for role in Role::ALL {
            assert_eq!(Role::from_stage_name(role.as_str()), Some(role));
        }
        assert_eq!(Role::from_stage_name("Analysis"), None);
        assert_eq!(Role::from_stage_name("analysis_v2"), None);
        assert_eq!(Role::Refinement.to_string(), "refinement");
    }

    #[test]
    fn test_optional_roles() {
        assert!(!Role::Analysis.is_optional());
        assert!(!Role::Generation.is_optional());
        assert!(Role::Execution.is_optional());
        assert!(Role::Refinement.is_optional());
        assert!(Role::Postprocess.is_optional());
    }

    #[test]
    fn test_seed_is_not_a_round() {
        let conv = ConversationState::with_seed("How many singers?");
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.round(), 0);
        assert_eq!(conv.last_sender(), Some(SEED_SENDER));
        assert!(conv.seed().is_some());
    }

    #[test]
    fn test_append_assigns_indices_and_rounds() {
        let mut conv = ConversationState::with_seed("q");
        let msg = conv.append("analysis", "tables: singer");
        assert_eq!(msg.index, 1);
        conv.append("generation", "SELECT count(*) FROM singer");

        assert_eq!(conv.round(), 2);
        assert_eq!(conv.len(), 3);
        assert!(conv.len() >= conv.round());
        assert_eq!(conv.last().map(|m| m.index), Some(2));
        assert_eq!(conv.count_from("generation"), 1);
        assert_eq!(conv.count_from("refinement"), 0);
    }

    #[test]
    fn test_empty_conversation() {
        let mut conv = ConversationState::new();
        assert!(conv.is_empty());
        assert!(conv.last().is_none());
        assert!(conv.seed().is_none());
        assert!(!conv.is_terminal());
        conv.mark_terminal();
        assert!(conv.is_terminal());
    }
}
