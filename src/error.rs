//! Error types shared across sqlforge subsystems.
//!
//! Subsystem-specific errors (trace lifecycle, failure log, schema catalog,
//! orchestration) live next to the code that raises them. This module keeps
//! the errors for the external text-generation service, which several
//! subsystems depend on.

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: LITELLM_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Context length exceeded: {limit} tokens")]
    ContextLengthExceeded { limit: u32 },

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LlmError {
    /// Whether retrying the same request later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RequestFailed(_) | LlmError::RateLimited(_) => true,
            LlmError::ApiError { code, .. } => *code >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_error_display() {
        let err = LlmError::ApiError {
            code: 502,
            message: "bad gateway".to_string(),
        };
        assert_eq!(err.to_string(), "API error (502): bad gateway");

        let err = LlmError::ContextLengthExceeded { limit: 8192 };
        assert!(err.to_string().contains("8192"));
    }

    #[test]
    fn test_llm_error_transience() {
        assert!(LlmError::RateLimited("slow down".to_string()).is_transient());
        assert!(LlmError::RequestFailed("reset".to_string()).is_transient());
        assert!(LlmError::ApiError {
            code: 503,
            message: "unavailable".to_string()
        }
        .is_transient());
        assert!(!LlmError::ApiError {
            code: 400,
            message: "bad request".to_string()
        }
        .is_transient());
        assert!(!LlmError::MissingApiBase.is_transient());
    }
}
