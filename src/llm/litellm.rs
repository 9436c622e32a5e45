//! LiteLLM-compatible client used by the language-model stages.
//!
//! Any OpenAI-compatible `/chat/completions` endpoint works: a LiteLLM proxy,
//! OpenRouter, or a local inference server. Stages build one
//! [`GenerationRequest`] per invocation; the model falls back to the
//! client's default when the request leaves it empty.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::LlmError;

/// Model used when neither the request nor the environment names one.
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

/// OpenRouter endpoint used by [`LiteLlmClient::new_with_defaults`].
const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";

/// Default timeout for a single completion call.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// A chat message sent to or received from the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// "system", "user" or "assistant".
    pub role: String,
    pub content: String,
}

impl Message {
    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }
}

/// One chat completion request.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    /// Model identifier. Empty selects the client's default model.
    pub model: String,
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0). SQL stages run at 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A completed generation.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

impl GenerationResponse {
    /// Content of the first choice, if any.
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// A single generated choice.
#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    #[serde(deserialize_with = "deserialize_message")]
    pub message: Message,
    /// "stop", "length" and so on. Some providers omit it.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Something that can complete a chat.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;
}

/// Client for LiteLLM-compatible APIs.
pub struct LiteLlmClient {
    api_base: String,
    api_key: Option<String>,
    default_model: String,
    http_client: Client,
}

impl LiteLlmClient {
    /// Creates a client for `api_base` (e.g. "http://localhost:4000").
    pub fn new(api_base: String, api_key: Option<String>, default_model: String) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            default_model,
            http_client: build_http_client(DEFAULT_HTTP_TIMEOUT),
        }
    }

    /// Creates a client for OpenRouter using [`DEFAULT_MODEL`].
    pub fn new_with_defaults(api_key: String) -> Self {
        Self::new(
            OPENROUTER_API_BASE.to_string(),
            Some(api_key),
            DEFAULT_MODEL.to_string(),
        )
    }

    /// Creates a client from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `LITELLM_API_BASE`: Base URL for the API (required)
    /// - `LITELLM_API_KEY`: API key for authentication (optional)
    /// - `LITELLM_DEFAULT_MODEL`: Default model (defaults to [`DEFAULT_MODEL`])
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingApiBase` if `LITELLM_API_BASE` is not set.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_base = env::var("LITELLM_API_BASE").map_err(|_| LlmError::MissingApiBase)?;
        let api_key = env::var("LITELLM_API_KEY").ok();
        let default_model =
            env::var("LITELLM_DEFAULT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        Ok(Self::new(api_base, api_key, default_model))
    }

    /// Creates a client from `LITELLM_*` variables, falling back to OpenRouter
    /// when only `OPENROUTER_API_KEY` is set.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingApiKey` if neither source is configured.
    pub fn from_env_or_openrouter() -> Result<Self, LlmError> {
        match Self::from_env() {
            Err(LlmError::MissingApiBase) => env::var("OPENROUTER_API_KEY")
                .map(Self::new_with_defaults)
                .map_err(|_| LlmError::MissingApiKey),
            other => other,
        }
    }

    /// Replaces the per-request HTTP timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http_client = build_http_client(timeout);
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    /// The request as sent, with the default model filled in.
    fn resolve(&self, mut request: GenerationRequest) -> GenerationRequest {
        if request.model.trim().is_empty() {
            request.model = self.default_model.clone();
        }
        request
    }
}

fn build_http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Message as returned by the API; `content` may be null.
#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

fn deserialize_message<'de, D>(deserializer: D) -> Result<Message, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = ApiMessage::deserialize(deserializer)?;
    Ok(Message {
        role: raw.role.unwrap_or_else(|| "assistant".to_string()),
        content: raw.content.unwrap_or_default(),
    })
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Maps a non-success HTTP status and body to an [`LlmError`].
fn error_from_status(status: StatusCode, body: &str, model: &str) -> LlmError {
    let message = serde_json::from_str::<ApiErrorResponse>(body)
        .map(|r| r.error.message)
        .unwrap_or_else(|_| body.trim().to_string());

    match status {
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited(message),
        StatusCode::NOT_FOUND if message.to_lowercase().contains("model") => {
            LlmError::InvalidModel(model.to_string())
        }
        _ => LlmError::ApiError {
            code: status.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl LlmProvider for LiteLlmClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let request = self.resolve(request);
        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Sending completion request"
        );

        let mut http_request = self
            .http_client
            .post(self.completions_url())
            .header("HTTP-Referer", "https://sqlforge.local")
            .header("X-Title", "sqlforge");
        if let Some(api_key) = &self.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        let http_response = http_request
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = http_response.status();
        if !status.is_success() {
            let body = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(error_from_status(status, &body, &request.model));
        }

        http_response
            .json::<GenerationResponse>()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::system("s").role, "system");
        assert_eq!(Message::user("u").role, "user");
        let assistant = Message::assistant("Hi there!");
        assert_eq!(assistant.role, "assistant");
        assert_eq!(assistant.content, "Hi there!");
    }

    #[test]
    fn test_request_serialization_skips_unset_options() {
        let request = GenerationRequest::new("gpt-4", vec![Message::user("test")])
            .with_temperature(0.0);

        let json = serde_json::to_value(&request).expect("serialization should succeed");
        assert_eq!(json["model"], "gpt-4");
        assert_eq!(json["temperature"], 0.0);
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn test_resolve_fills_default_model() {
        let client = LiteLlmClient::new("http://localhost:4000/".to_string(), None, "m-default".to_string());

        let resolved = client.resolve(GenerationRequest::new("", vec![Message::user("q")]));
        assert_eq!(resolved.model, "m-default");

        let resolved = client.resolve(GenerationRequest::new("m-explicit", vec![]));
        assert_eq!(resolved.model, "m-explicit");

        assert_eq!(client.api_base(), "http://localhost:4000");
        assert_eq!(client.completions_url(), "http://localhost:4000/chat/completions");
        assert!(!client.has_api_key());
    }

    #[test]
    fn test_new_with_defaults_targets_openrouter() {
        let client = LiteLlmClient::new_with_defaults("test-api-key".to_string());
        assert_eq!(client.api_base(), OPENROUTER_API_BASE);
        assert_eq!(client.default_model(), DEFAULT_MODEL);
        assert!(client.has_api_key());
    }

    #[test]
    fn test_response_tolerates_null_content_and_missing_usage() {
        let body = r#"{
            "id": "gen-1",
            "model": "openai/gpt-4o-mini",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": null}, "finish_reason": null}]
        }"#;

        let response: GenerationResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.first_content(), Some(""));
        assert_eq!(response.choices[0].finish_reason, None);
        assert_eq!(response.usage, Usage::default());
    }

    #[test]
    fn test_response_first_content() {
        let body = r#"{
            "choices": [{"message": {"content": "SELECT 1"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;

        let response: GenerationResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.first_content(), Some("SELECT 1"));
        assert_eq!(response.choices[0].message.role, "assistant");
        assert_eq!(response.usage.total_tokens, 15);

        let empty: GenerationResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert_eq!(empty.first_content(), None);
    }

    #[test]
    fn test_error_from_status() {
        let err = error_from_status(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error": {"message": "quota exceeded", "type": "rate_limit"}}"#,
            "m",
        );
        assert!(matches!(err, LlmError::RateLimited(ref m) if m == "quota exceeded"));

        let err = error_from_status(
            StatusCode::NOT_FOUND,
            r#"{"error": {"message": "No such model"}}"#,
            "bogus/model",
        );
        assert!(matches!(err, LlmError::InvalidModel(ref m) if m == "bogus/model"));

        let err = error_from_status(StatusCode::BAD_GATEWAY, "upstream down\n", "m");
        assert!(matches!(
            err,
            LlmError::ApiError { code: 502, ref message } if message == "upstream down"
        ));
    }

    #[tokio::test]
    async fn test_generate_connection_error() {
        let client = LiteLlmClient::new("http://127.0.0.1:9".to_string(), None, "gpt-4".to_string())
            .with_timeout(Duration::from_secs(5));

        let result = client
            .generate(GenerationRequest::new("", vec![Message::user("test")]))
            .await;

        assert!(matches!(result, Err(LlmError::RequestFailed(_))));
    }
}
