//! Provider adapters for paperflow
//!
//! One adapter per LLM endpoint, all behind the [`LlmClient`] trait. The
//! adapters own wire details, per-call timeouts, and error classification;
//! everything above them deals only in [`CompletionRequest`] /
//! [`CompletionResponse`] and the [`LlmError`] taxonomy.

use std::sync::Arc;

use tracing::debug;

mod anthropic;
mod client;
mod error;
mod gemini;
mod local;
mod openai;

pub use anthropic::AnthropicClient;
pub use client::{CompletionRequest, CompletionResponse, LlmClient, ProviderKind, TokenUsage};
pub use error::LlmError;
pub use gemini::GeminiClient;
pub use local::LocalClient;
pub use openai::OpenAiClient;

#[cfg(test)]
pub use client::mock;

use crate::config::ProviderConfig;

/// Create an adapter for the given provider
pub fn create_client(kind: ProviderKind, config: &ProviderConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    debug!(provider = %kind, model = %config.model, "create_client: called");
    match kind {
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicClient::from_config(config)?)),
        ProviderKind::OpenAi => Ok(Arc::new(OpenAiClient::from_config(config)?)),
        ProviderKind::Gemini => Ok(Arc::new(GeminiClient::from_config(config)?)),
        ProviderKind::Local => Ok(Arc::new(LocalClient::from_config(config)?)),
    }
}
