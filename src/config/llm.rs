use secrecy::{ExposeSecret, SecretString};

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Absent means LLM-backed features are reported disabled.
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 2048,
            temperature: 0.3,
        }
    }
}

impl LlmConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let temperature = parse_optional_env("OPENAI_TEMPERATURE", defaults.temperature)?;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::InvalidValue {
                key: "OPENAI_TEMPERATURE".to_string(),
                message: "must be between 0 and 2".to_string(),
            });
        }
        Ok(Self {
            api_key: optional_env("OPENAI_API_KEY")?.map(SecretString::from),
            base_url: optional_env("OPENAI_BASE_URL")?.unwrap_or(defaults.base_url),
            model: optional_env("OPENAI_MODEL")?.unwrap_or(defaults.model),
            max_tokens: parse_optional_env("OPENAI_MAX_TOKENS", defaults.max_tokens)?,
            temperature,
        })
    }

    pub fn enabled(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_ref().map(|k| k.expose_secret())
    }
}
