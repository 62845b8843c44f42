//! OpenAI-compatible Chat Completions provider.
//!
//! Works against api.openai.com as well as any proxy exposing
//! `/v1/chat/completions` (vLLM, LiteLLM, local gateways).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider};
use crate::llm::retry::{is_retryable_status, retry_backoff_delay};

const PROVIDER: &str = "openai_compatible_chat";
const DEFAULT_MAX_RETRIES: u32 = 3;
const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// OpenAI-compatible provider implementation over `/v1/chat/completions`.
pub struct OpenAiCompatibleChatProvider {
    client: Client,
    config: LlmConfig,
    max_retries: u32,
}

impl OpenAiCompatibleChatProvider {
    /// Create a provider. Fails with `NotConfigured` when no API key is set.
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        if config.api_key.is_none() {
            return Err(LlmError::NotConfigured);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            config,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn api_url(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');

        if base.ends_with("/v1") {
            format!("{}/{}", base, path)
        } else {
            format!("{}/v1/{}", base, path)
        }
    }

    fn api_key(&self) -> &str {
        self.config
            .api_key
            .as_ref()
            .map(|k| k.expose_secret())
            .unwrap_or_default()
    }

    async fn send_request(
        &self,
        body: &ChatCompletionRequest<'_>,
    ) -> Result<ChatCompletionResponse, LlmError> {
        let url = self.api_url("chat/completions");
        let mut attempt = 0;

        loop {
            tracing::debug!(%url, attempt = attempt + 1, model = %body.model, "Sending chat completion");

            let response = match self
                .client
                .post(&url)
                .bearer_auth(self.api_key())
                .json(body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) if attempt < self.max_retries => {
                    let delay = retry_backoff_delay(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt = attempt + 1,
                        ?delay,
                        "Chat completion request error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => {
                    return Err(LlmError::RequestFailed {
                        provider: PROVIDER.to_string(),
                        reason: e.to_string(),
                    });
                }
            };

            let status = response.status().as_u16();
            let text = response.text().await.map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("failed to read response body: {e}"),
            })?;
            if text.len() > MAX_RESPONSE_BYTES {
                return Err(LlmError::InvalidResponse {
                    provider: PROVIDER.to_string(),
                    reason: format!("response too large: {} bytes", text.len()),
                });
            }

            if (200..300).contains(&status) {
                return serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
                    provider: PROVIDER.to_string(),
                    reason: format!("JSON parse error: {e}"),
                });
            }

            if status == 401 || status == 403 {
                return Err(LlmError::AuthFailed {
                    provider: PROVIDER.to_string(),
                });
            }

            if is_retryable_status(status) && attempt < self.max_retries {
                let delay = retry_backoff_delay(attempt);
                tracing::warn!(status, attempt = attempt + 1, ?delay, "Chat completion failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            if status == 429 {
                return Err(LlmError::RateLimited {
                    provider: PROVIDER.to_string(),
                });
            }

            return Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("HTTP {}: {}", status, truncate(&text, 500)),
            });
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: String,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    usage: Option<ChatCompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatCompletionUsage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
    #[serde(default)]
    total_tokens: Option<u32>,
}

fn parse_usage(usage: Option<&ChatCompletionUsage>) -> (u32, u32) {
    let Some(usage) = usage else {
        return (0, 0);
    };
    let input = usage.prompt_tokens.unwrap_or(0);
    let output = usage
        .completion_tokens
        .unwrap_or_else(|| usage.total_tokens.unwrap_or(0).saturating_sub(input));
    (input, output)
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleChatProvider {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn default_max_tokens(&self) -> u32 {
        self.config.max_tokens
    }

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let request = ChatCompletionRequest {
            model: req.model.unwrap_or_else(|| self.config.model.clone()),
            messages: &req.messages,
            temperature: req.temperature.or(Some(self.config.temperature)),
            max_tokens: req.max_tokens.or(Some(self.config.max_tokens)),
            response_format: req.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response = self.send_request(&request).await?;
        let (input_tokens, output_tokens) = parse_usage(response.usage.as_ref());
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: "No choices in response".to_string(),
            })?;

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            model: response.model.unwrap_or(request.model),
            input_tokens,
            output_tokens,
        })
    }
}
