//! LLM integration.

mod openai_compatible_chat;
mod provider;
pub mod retry;

use std::sync::Arc;

pub use openai_compatible_chat::OpenAiCompatibleChatProvider;
pub use provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, Role};

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Build the configured provider, or `None` when no API key is set.
pub fn create_llm_provider(config: &LlmConfig) -> Result<Option<Arc<dyn LlmProvider>>, LlmError> {
    if !config.enabled() {
        return Ok(None);
    }
    let provider = OpenAiCompatibleChatProvider::new(config.clone())?;
    tracing::info!(model = %config.model, base_url = %config.base_url, "LLM provider configured");
    Ok(Some(Arc::new(provider)))
}
