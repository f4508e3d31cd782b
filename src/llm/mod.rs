//! LLM gateway
//!
//! The workflows never talk to a provider directly. They build a
//! [`CompletionRequest`], hand it to whatever [`LlmGateway`] the service was
//! wired with, and get back the text together with token usage and an
//! estimated cost for the telemetry event.

pub mod anthropic;
pub mod cost;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use anthropic::AnthropicGateway;
pub use cost::{CostAnalyzer, ModelPricing};

/// One completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Base64 images attached to the user turn (tiered vision)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageInput>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: String::new(),
            prompt: prompt.into(),
            temperature: 0.1,
            max_tokens: 1024,
            images: vec![],
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn with_limits(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_image(mut self, image: ImageInput) -> Self {
        self.images.push(image);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInput {
    pub media_type: String,
    pub data: String,
}

/// What came back from the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

/// Error types for LLM operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum LLMError {
    #[error("Rate limit exceeded for provider: {0}")]
    RateLimitExceeded(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnhealthy(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LLMError {
    /// Worth another attempt within the workflow's retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LLMError::RateLimitExceeded(_)
                | LLMError::ProviderUnhealthy(_)
                | LLMError::Timeout(_)
                | LLMError::Network(_)
        )
    }
}

/// Result type for LLM operations
pub type LLMResult<T> = Result<T, LLMError>;

/// Anything that can turn a prompt into text.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> LLMResult<Completion>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = CompletionRequest::new("claude-3-haiku-20240307", "hello")
            .with_system("be brief")
            .with_limits(0.3, 256);
        assert_eq!(request.system, "be brief");
        assert_eq!(request.max_tokens, 256);
        assert!(request.images.is_empty());
    }

    #[test]
    fn test_transient_errors() {
        assert!(LLMError::Timeout("30s".into()).is_transient());
        assert!(LLMError::RateLimitExceeded("anthropic".into()).is_transient());
        assert!(!LLMError::AuthenticationFailed("bad key".into()).is_transient());
        assert!(!LLMError::Serialization("eof".into()).is_transient());
    }
}
