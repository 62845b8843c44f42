//! Configuration for ironplan.
//!
//! Everything comes from the environment (optionally seeded from `.env` by
//! `dotenvy` at startup), resolved once into typed sub-configs.

mod executor;
mod gateway;
pub(crate) mod helpers;
mod llm;
mod rewrite;
mod sandbox;
mod webhook;

use std::path::PathBuf;

use serde::Serialize;

pub use executor::ExecutorConfig;
pub use gateway::GatewayConfig;
pub use llm::LlmConfig;
pub use rewrite::{RewriteConfig, default_backup_path};
pub use sandbox::SandboxConfig;
pub use webhook::WebhookConfig;

use crate::config::helpers::optional_env;
use crate::error::ConfigError;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "invalid log format '{}', expected 'pretty' or 'json'",
                s
            )),
        }
    }
}

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub log_level: String,
    pub log_format: LogFormat,
    pub gateway: GatewayConfig,
    pub executor: ExecutorConfig,
    pub sandbox: SandboxConfig,
    pub rewrite: RewriteConfig,
    pub webhook: WebhookConfig,
    pub llm: LlmConfig,
}

/// Optional subsystems, as reported by `/healthz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    pub llm: bool,
    pub deploy: bool,
    pub rewrite: bool,
    pub webhook: bool,
    pub http_capability: bool,
}

impl Config {
    /// Resolve the whole configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = optional_env("DATA_DIR")?
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let log_format = match optional_env("LOG_FORMAT")? {
            Some(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "LOG_FORMAT".to_string(),
                message,
            })?,
            None => LogFormat::default(),
        };

        let gateway = GatewayConfig::resolve()?;
        let executor = ExecutorConfig::resolve(&data_dir)?;
        let sandbox = SandboxConfig::resolve(&data_dir, executor.step_timeout)?;
        let rewrite = RewriteConfig::resolve()?;
        let webhook = WebhookConfig::resolve()?;
        let llm = LlmConfig::resolve()?;

        let config = Self {
            log_level: optional_env("LOG_LEVEL")?.unwrap_or_else(|| "info".to_string()),
            log_format,
            data_dir,
            gateway,
            executor,
            sandbox,
            rewrite,
            webhook,
            llm,
        };
        config.validate()?;
        Ok(config)
    }

    /// A configuration for local use and tests: everything in `data_dir`,
    /// no LLM, no rewrite.
    pub fn local(admin_token: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let executor = ExecutorConfig {
            runs_path: data_dir.join("runs.jsonl"),
            ..ExecutorConfig::default()
        };
        let sandbox = SandboxConfig {
            audit_path: data_dir.join("deploy-audit.jsonl"),
            ..SandboxConfig::default()
        };
        Self {
            data_dir,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            gateway: GatewayConfig::new(admin_token),
            executor,
            sandbox,
            rewrite: RewriteConfig::disabled(),
            webhook: WebhookConfig::new("local-webhook-secret"),
            llm: LlmConfig::default(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(key) = self.rewrite.key()
            && key == self.gateway.admin_token()
        {
            return Err(ConfigError::InvalidValue {
                key: "REWRITE_KEY".to_string(),
                message: "must differ from ADMIN_TOKEN".to_string(),
            });
        }
        Ok(())
    }

    pub fn features(&self) -> Features {
        Features {
            llm: self.llm.enabled(),
            deploy: self.sandbox.deploy_enabled,
            rewrite: self.rewrite.enabled(),
            webhook: !self.webhook.generated,
            http_capability: self.sandbox.http_capability().is_some(),
        }
    }

    /// Default `EnvFilter` directive.
    pub fn log_filter(&self) -> String {
        format!("ironplan={},tower_http=info", self.log_level)
    }
}
