use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::helpers::{
    optional_env, parse_bool_env, parse_duration_ms_env, parse_optional_env,
};
use crate::error::ConfigError;
use crate::tools::wasm::HttpCapability;

/// Tool deployment and the WASM sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub deploy_enabled: bool,
    pub dry_run_timeout: Duration,
    pub memory_limit_bytes: usize,
    /// Deadline for a deployed tool's real invocations.
    pub tool_timeout: Duration,
    /// Raw `WASM_HTTP_ALLOWLIST`. Empty means no guest may use HTTP.
    pub http_allowlist: String,
    pub audit_path: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            deploy_enabled: true,
            dry_run_timeout: Duration::from_secs(3),
            memory_limit_bytes: 16 * 1024 * 1024,
            tool_timeout: Duration::from_secs(10),
            http_allowlist: String::new(),
            audit_path: PathBuf::from("./data/deploy-audit.jsonl"),
        }
    }
}

impl SandboxConfig {
    pub(crate) fn resolve(data_dir: &Path, step_timeout: Duration) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let memory_limit_bytes =
            parse_optional_env("WASM_MEMORY_LIMIT_BYTES", defaults.memory_limit_bytes)?;
        if memory_limit_bytes < 64 * 1024 {
            return Err(ConfigError::InvalidValue {
                key: "WASM_MEMORY_LIMIT_BYTES".to_string(),
                message: "must be at least one 64 KiB page".to_string(),
            });
        }
        Ok(Self {
            deploy_enabled: parse_bool_env("DEPLOY_ENABLED", defaults.deploy_enabled)?,
            dry_run_timeout: parse_duration_ms_env("DRY_RUN_TIMEOUT_MS", defaults.dry_run_timeout)?,
            memory_limit_bytes,
            tool_timeout: parse_duration_ms_env("WASM_TOOL_TIMEOUT_MS", step_timeout)?,
            http_allowlist: optional_env("WASM_HTTP_ALLOWLIST")?.unwrap_or_default(),
            audit_path: optional_env("DEPLOY_AUDIT_PATH")?
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("deploy-audit.jsonl")),
        })
    }

    /// HTTP capability offered to guests that ask for it, if the operator configured one.
    pub fn http_capability(&self) -> Option<HttpCapability> {
        HttpCapability::from_allowlist(&self.http_allowlist)
    }
}
