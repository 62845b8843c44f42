use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::config::helpers::{optional_env, parse_duration_ms_env};
use crate::error::ConfigError;

/// Self-rewrite of the live source file.
///
/// The subsystem is off unless `REWRITE_KEY` is set.
#[derive(Debug, Clone)]
pub struct RewriteConfig {
    pub key: Option<SecretString>,
    pub source_path: PathBuf,
    pub backup_path: PathBuf,
    /// Pause between replying to the caller and exiting.
    pub restart_delay: Duration,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

impl RewriteConfig {
    pub fn disabled() -> Self {
        Self {
            key: None,
            source_path: PathBuf::new(),
            backup_path: PathBuf::new(),
            restart_delay: Duration::from_millis(500),
        }
    }

    pub fn new(key: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        let source_path = source_path.into();
        Self {
            key: Some(SecretString::from(key.into())),
            backup_path: default_backup_path(&source_path),
            source_path,
            ..Self::disabled()
        }
    }

    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let Some(key) = optional_env("REWRITE_KEY")? else {
            return Ok(Self::disabled());
        };
        let source_path = optional_env("REWRITE_SOURCE_PATH")?
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "REWRITE_SOURCE_PATH".to_string(),
                hint: "REWRITE_SOURCE_PATH is required when REWRITE_KEY is set".to_string(),
            })?;
        let mut config = Self::new(key, source_path);
        if let Some(backup) = optional_env("REWRITE_BACKUP_PATH")? {
            config.backup_path = PathBuf::from(backup);
        }
        config.restart_delay = parse_duration_ms_env("REWRITE_RESTART_DELAY_MS", config.restart_delay)?;
        Ok(config)
    }

    pub fn enabled(&self) -> bool {
        self.key.is_some()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_ref().map(|k| k.expose_secret())
    }
}

/// `<source>.bak` next to the live file.
pub fn default_backup_path(source: &std::path::Path) -> PathBuf {
    let mut name = source.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}
