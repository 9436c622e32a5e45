//! Language-model backed stage.

use async_trait::async_trait;
use std::sync::Arc;

use super::{Capability, Stage, StageError};
use crate::conversation::{ConversationState, Role};
use crate::llm::{GenerationRequest, LlmProvider, Message as ChatMessage};

/// A stage that asks a language model for the next message.
///
/// The conversation is replayed as chat history: this stage's own earlier
/// messages become `assistant` turns, everything else becomes a `user` turn
/// tagged with its sender.
pub struct LlmStage {
    name: String,
    system_prompt: String,
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    capabilities: Vec<Capability>,
}

impl LlmStage {
    /// Creates a stage named after `role`, with the role's default
    /// capabilities.
    pub fn new(role: Role, system_prompt: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        let capabilities = match role {
            Role::Refinement => vec![Capability::Refine],
            Role::Postprocess => vec![Capability::TerminalCandidate],
            _ => Vec::new(),
        };
        Self {
            name: role.as_str().to_string(),
            system_prompt: system_prompt.into(),
            provider,
            model: String::new(),
            temperature: None,
            max_tokens: None,
            capabilities,
        }
    }

    /// Overrides the stage name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Model to request. Empty uses the provider's default.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Chat history for a request.
    pub fn build_messages(&self, conversation: &ConversationState) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        for message in conversation.messages() {
            if message.sender == self.name {
                messages.push(ChatMessage::assistant(message.content.clone()));
            } else {
                messages.push(ChatMessage::user(format!(
                    "[{}]\n{}",
                    message.sender, message.content
                )));
            }
        }
        messages
    }

    fn build_request(&self, conversation: &ConversationState) -> GenerationRequest {
        let mut request = GenerationRequest::new(self.model.clone(), self.build_messages(conversation));
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }
}

#[async_trait]
impl Stage for LlmStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn invoke(&self, conversation: &ConversationState) -> Result<String, StageError> {
        let request = self.build_request(conversation);
        tracing::debug!(
            stage = %self.name,
            messages = request.messages.len(),
            "Requesting completion"
        );

        let response = self.provider.generate(request).await.map_err(|e| {
            tracing::warn!(
                stage = %self.name,
                transient = e.is_transient(),
                error = %e,
                "Completion request failed"
            );
            StageError::Llm(e)
        })?;

        tracing::debug!(
            stage = %self.name,
            model = %response.model,
            total_tokens = response.usage.total_tokens,
            "Completion received"
        );

        match response.first_content().map(str::trim) {
            Some(content) if !content.is_empty() => Ok(content.to_string()),
            _ => Err(StageError::EmptyResponse),
        }
    }
}
