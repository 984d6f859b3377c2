//! Language-model capability used by the translator and the formatter
//!
//! The pipeline only relies on `complete(prompt, max_tokens)`. Providers plug
//! in behind [`LanguageModel`]; tests use [`scripted::ScriptedModel`].

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::model::TokenUsage;

pub mod anthropic;
pub mod openai;
pub mod scripted;

pub use anthropic::AnthropicModel;
pub use openai::OpenAiModel;
pub use scripted::ScriptedModel;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model request failed: {0}")]
    Transport(String),

    #[error("model service error: {0}")]
    Service(String),

    #[error("model response could not be read: {0}")]
    InvalidResponse(String),

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
}

impl LlmError {
    /// Whether the provider answered with something that was not text
    pub fn is_malformed(&self) -> bool {
        matches!(self, LlmError::InvalidResponse(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<Completion, LlmError>;

    fn provider_name(&self) -> &'static str;

    fn model_name(&self) -> &str;
}

/// Run one completion under a per-call timeout
pub async fn complete_with_timeout(
    model: &dyn LanguageModel,
    prompt: &str,
    max_tokens: u32,
    timeout: Duration,
) -> Result<Completion, LlmError> {
    match tokio::time::timeout(timeout, model.complete(prompt, max_tokens)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(timeout)),
    }
}
