//! Administrative bookkeeping: the append-only audit trail and the lock
//! that serializes deploys, rewrites and rollbacks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::StoreError;
use crate::tools::redaction::redacted;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Deploy,
    Undeploy,
    Rewrite,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub action: AuditAction,
    pub name: String,
    pub outcome: AuditOutcome,
    /// Last pipeline stage reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Error code on rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Digest of the submitted code, never the code itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, name: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            ts: Utc::now(),
            action,
            name: name.into(),
            outcome,
            stage: None,
            code: None,
            sha256: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_digest_of(mut self, content: &[u8]) -> Self {
        self.sha256 = Some(sha256_hex(content));
        self
    }
}

/// Shared by every administrative entry point; at most one deploy, rewrite
/// or rollback runs at a time.
#[derive(Debug, Clone, Default)]
pub struct AdminLock(Arc<Mutex<()>>);

impl AdminLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.0).lock_owned().await
    }

    /// Non-blocking variant, `None` while another admin action holds the lock.
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.0).try_lock_owned().ok()
    }
}

pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// JSON-lines audit file. `None` path keeps entries in tracing only.
pub struct AuditLog {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            lock: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record an entry. Failures to write are logged and swallowed so the
    /// audited action's result is unaffected.
    pub async fn record(&self, entry: AuditEntry) {
        tracing::info!(
            action = ?entry.action,
            name = %entry.name,
            outcome = ?entry.outcome,
            stage = entry.stage.as_deref().unwrap_or_default(),
            code = entry.code.as_deref().unwrap_or_default(),
            "audit"
        );
        if let Err(e) = self.write(&entry).await {
            tracing::warn!(error = %e, "Failed to write audit entry");
        }
    }

    async fn write(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(&redacted(entry)?)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// All entries on disk, oldest first. Unreadable lines are skipped.
    pub async fn entries(&self) -> Result<Vec<AuditEntry>, StoreError> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
