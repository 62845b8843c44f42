//! `llm.generate`: single-turn text generation.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput};

/// Hard ceiling on completion length for a single step.
const MAX_TOKENS_CAP: u32 = 1024;

const STYLE_PROMPT: &str = "You are a concise assistant executing one step of an automated plan. \
Answer briefly and clearly, in at most five short bullet points or sentences. \
Avoid code blocks and heavy markdown.";

pub struct LlmGenerateTool {
    llm: Arc<dyn LlmProvider>,
}

impl LlmGenerateTool {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

impl From<LlmError> for ToolError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::RateLimited { .. } => ToolError::RateLimited(None),
            LlmError::AuthFailed { .. } | LlmError::NotConfigured => {
                ToolError::NotAuthorized(err.to_string())
            }
            other => ToolError::ExternalService(other.to_string()),
        }
    }
}

#[async_trait]
impl Tool for LlmGenerateTool {
    fn name(&self) -> &str {
        "llm.generate"
    }

    fn description(&self) -> &str {
        "Generate text from a prompt. Returns the completion as a string."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string" },
                "temperature": { "type": "number" },
                "model": { "type": "string" },
                "max_tokens": { "type": "integer", "maximum": MAX_TOKENS_CAP }
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let prompt = match params.get("prompt") {
            Some(serde_json::Value::String(s)) => s.clone(),
            // A `$ref` may hand us structured output from an earlier step.
            Some(other) if !other.is_null() => other.to_string(),
            _ => String::new(),
        };

        let requested = params
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX));
        let max_tokens = requested
            .unwrap_or_else(|| self.llm.default_max_tokens())
            .min(MAX_TOKENS_CAP);

        let mut request = CompletionRequest::new(vec![
            ChatMessage::system(STYLE_PROMPT),
            ChatMessage::user(prompt),
        ])
        .with_max_tokens(max_tokens);
        if let Some(t) = params.get("temperature").and_then(|v| v.as_f64()) {
            request = request.with_temperature(t as f32);
        }
        if let Some(model) = params.get("model").and_then(|v| v.as_str()) {
            request = request.with_model(model);
        }

        tracing::debug!(plan_id = ctx.plan_id, step = ctx.step_index, max_tokens, "llm.generate");
        let response = self.llm.complete(request).await?;
        Ok(ToolOutput::text(response.content, start.elapsed()))
    }
}
