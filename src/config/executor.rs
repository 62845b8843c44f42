use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::helpers::{optional_env, parse_duration_ms_env, parse_optional_env};
use crate::error::ConfigError;

/// Step execution and run persistence.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Deadline for one handler attempt.
    pub step_timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff before retry `n` is `backoff_base * n`.
    pub backoff_base: Duration,
    /// Append-only JSONL file of run records.
    pub runs_path: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(10),
            max_retries: 2,
            backoff_base: Duration::from_millis(500),
            runs_path: PathBuf::from("./data/runs.jsonl"),
        }
    }
}

impl ExecutorConfig {
    pub(crate) fn resolve(data_dir: &Path) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            step_timeout: parse_duration_ms_env("STEP_TIMEOUT_MS", defaults.step_timeout)?,
            max_retries: parse_optional_env("STEP_MAX_RETRIES", defaults.max_retries)?,
            backoff_base: parse_duration_ms_env("STEP_BACKOFF_MS", defaults.backoff_base)?,
            runs_path: optional_env("RUNS_PATH")?
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("runs.jsonl")),
        })
    }
}
