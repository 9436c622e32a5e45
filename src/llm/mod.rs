//! LLM integration for sqlforge.
//!
//! The language-model stages talk to an OpenAI-compatible chat completion
//! endpoint through the [`LlmProvider`] trait. Tests substitute scripted
//! providers; production code uses [`LiteLlmClient`].
//!
//! ```ignore
//! use sqlforge::llm::{GenerationRequest, LiteLlmClient, LlmProvider, Message};
//!
//! let client = LiteLlmClient::from_env()?;
//! let request = GenerationRequest::new("", vec![Message::user("SELECT 1?")]);
//! let response = client.generate(request).await?;
//! ```

pub mod litellm;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
    DEFAULT_MODEL,
};
