//! Conversation model and stage routing.
//!
//! A conversation starts with a seed message and grows by one message per
//! stage invocation. The [`Router`] decides which role speaks next.

pub mod router;
pub mod types;

pub use router::{
    Decision, DeadEndReason, Router, RouterConfig, DEFAULT_ERROR_MARKER,
    DEFAULT_TERMINATION_MARKER,
};
pub use types::{ConversationState, Message, Role, SEED_SENDER};
