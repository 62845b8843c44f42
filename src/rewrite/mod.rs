//! Supervised replacement of the service's live source.
//!
//! The live source is a sandbox module loaded at boot as the `service` tool
//! (see [`load_live_source`]). A rewrite validates the new source, snapshots
//! the current file into a single backup slot, swaps the live file atomically
//! and then asks the process to exit so the supervisor restarts it on the new
//! code. Rollback restores the backup the same way. Nothing is ever patched in
//! memory.

mod fs;
mod restart;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::audit::{AdminLock, AuditAction, AuditEntry, AuditLog, AuditOutcome, sha256_hex};
use crate::config::RewriteConfig;
use crate::error::RewriteError;
use crate::tools::wasm::{Capabilities, WasmRuntime, WasmTool};

/// Registry name of the tool backed by the live source.
pub const SERVICE_TOOL: &str = "service";

pub use fs::atomic_write;
pub use restart::{ProcessRestarter, Restarter};

/// Decides whether new source may go live.
pub trait SourceValidator: Send + Sync {
    fn validate(&self, source: &[u8]) -> Result<(), String>;
}

/// Accepts only source that loads as the `service` tool: it compiles, has
/// the guest exports and imports nothing beyond the default host functions.
pub struct WasmSourceValidator {
    runtime: Arc<WasmRuntime>,
}

impl WasmSourceValidator {
    pub fn new(runtime: Arc<WasmRuntime>) -> Self {
        Self { runtime }
    }
}

impl SourceValidator for WasmSourceValidator {
    fn validate(&self, source: &[u8]) -> Result<(), String> {
        self.runtime
            .prepare(source, Capabilities::none())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Read the live source and build the `service` tool from it.
///
/// Runs once at startup, so a rewrite takes effect on the restart that
/// follows it.
pub fn load_live_source(
    config: &RewriteConfig,
    runtime: &Arc<WasmRuntime>,
    timeout: Duration,
) -> Result<WasmTool, RewriteError> {
    let source = &config.source_path;
    let code = std::fs::read(source).map_err(|e| RewriteError::io("read", source, e))?;
    let module = runtime
        .prepare(&code, Capabilities::none())
        .map_err(|e| RewriteError::SyntaxInvalid {
            reason: e.to_string(),
        })?;
    tracing::info!(
        source = %source.display(),
        sha256 = %sha256_hex(&code),
        "Loaded live source"
    );
    Ok(WasmTool::new(
        SERVICE_TOOL,
        format!("Service handler loaded from {}", source.display()),
        Arc::clone(runtime),
        module,
        timeout,
    ))
}

/// What was applied; the restart follows after the configured delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteOutcome {
    pub message: String,
    pub sha256: String,
    pub bytes: usize,
    pub backup_path: PathBuf,
}

pub struct SelfRewriteManager {
    config: RewriteConfig,
    validator: Arc<dyn SourceValidator>,
    restarter: Arc<dyn Restarter>,
    audit: Arc<AuditLog>,
    lock: AdminLock,
}

impl SelfRewriteManager {
    pub fn new(
        config: RewriteConfig,
        validator: Arc<dyn SourceValidator>,
        restarter: Arc<dyn Restarter>,
        audit: Arc<AuditLog>,
        lock: AdminLock,
    ) -> Self {
        Self {
            config,
            validator,
            restarter,
            audit,
            lock,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled()
    }

    pub fn config(&self) -> &RewriteConfig {
        &self.config
    }

    /// Constant-time check of the dedicated rewrite credential.
    pub fn authorize(&self, secret: &str) -> Result<(), RewriteError> {
        let Some(key) = self.config.key() else {
            return Err(RewriteError::Disabled);
        };
        if bool::from(key.as_bytes().ct_eq(secret.as_bytes())) {
            Ok(())
        } else {
            Err(RewriteError::Unauthorized)
        }
    }

    pub async fn rewrite(&self, secret: &str, new_source: &str) -> Result<RewriteOutcome, RewriteError> {
        self.authorize(secret)?;
        let _admin = self.lock.acquire().await;
        let digest = sha256_hex(new_source.as_bytes());

        let result = self.apply_rewrite(new_source.as_bytes()).await;
        self.audit_result(AuditAction::Rewrite, &digest, &result).await;
        let outcome = result?;
        self.restarter.schedule_restart(self.config.restart_delay);
        Ok(outcome)
    }

    pub async fn rollback(&self, secret: &str) -> Result<RewriteOutcome, RewriteError> {
        self.authorize(secret)?;
        let _admin = self.lock.acquire().await;

        let result = self.apply_rollback().await;
        let digest = result.as_ref().map(|o| o.sha256.clone()).unwrap_or_default();
        self.audit_result(AuditAction::Rollback, &digest, &result).await;
        let outcome = result?;
        self.restarter.schedule_restart(self.config.restart_delay);
        Ok(outcome)
    }

    pub async fn has_backup(&self) -> bool {
        tokio::fs::try_exists(&self.config.backup_path)
            .await
            .unwrap_or(false)
    }

    async fn apply_rewrite(&self, new_source: &[u8]) -> Result<RewriteOutcome, RewriteError> {
        self.validator
            .validate(new_source)
            .map_err(|reason| RewriteError::SyntaxInvalid { reason })?;

        let source = &self.config.source_path;
        let backup = &self.config.backup_path;
        let current = tokio::fs::read(source)
            .await
            .map_err(|e| RewriteError::io("read", source, e))?;
        atomic_write(backup, &current)
            .await
            .map_err(|e| RewriteError::io("back up", backup, e))?;
        atomic_write(source, new_source)
            .await
            .map_err(|e| RewriteError::io("replace", source, e))?;

        tracing::warn!(
            source = %source.display(),
            backup = %backup.display(),
            bytes = new_source.len(),
            "Live source replaced, restart scheduled"
        );
        Ok(RewriteOutcome {
            message: "source replaced; restarting".to_string(),
            sha256: sha256_hex(new_source),
            bytes: new_source.len(),
            backup_path: backup.clone(),
        })
    }

    async fn apply_rollback(&self) -> Result<RewriteOutcome, RewriteError> {
        let source = &self.config.source_path;
        let backup = &self.config.backup_path;
        let previous = match tokio::fs::read(backup).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RewriteError::NoBackup {
                    path: backup.clone(),
                });
            }
            Err(e) => return Err(RewriteError::io("read", backup, e)),
        };
        atomic_write(source, &previous)
            .await
            .map_err(|e| RewriteError::io("restore", source, e))?;

        tracing::warn!(
            source = %source.display(),
            backup = %backup.display(),
            "Live source restored from backup, restart scheduled"
        );
        Ok(RewriteOutcome {
            message: "backup restored; restarting".to_string(),
            sha256: sha256_hex(&previous),
            bytes: previous.len(),
            backup_path: backup.clone(),
        })
    }

    async fn audit_result(
        &self,
        action: AuditAction,
        digest: &str,
        result: &Result<RewriteOutcome, RewriteError>,
    ) {
        let name = self.config.source_path.display().to_string();
        let mut entry = match result {
            Ok(_) => AuditEntry::new(action, name, AuditOutcome::Accepted),
            Err(e) => AuditEntry::new(action, name, AuditOutcome::Rejected).with_code(e.code()),
        };
        if !digest.is_empty() {
            entry.sha256 = Some(digest.to_string());
        }
        self.audit.record(entry).await;
    }
}
