//! Persistence of run records.
//!
//! Records are append-only: each run adds one redacted JSON line, and
//! nothing already written is rewritten.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::plan::RunRecord;
use crate::tools::redaction::redacted;

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Append a record. Sensitive fields are masked before they are written.
    async fn append(&self, record: &RunRecord) -> Result<(), StoreError>;

    /// Most recent record stored for `plan_id`, as persisted (redacted).
    async fn latest(&self, plan_id: &str) -> Result<Option<serde_json::Value>, StoreError>;
}

/// JSON-lines file store.
///
/// Keeps an index from plan id to the byte offset of that plan's newest line,
/// built by one scan on the first lookup and extended on every append, so a
/// lookup reads a single line. The store assumes it is the only writer.
pub struct FsRunStore {
    path: PathBuf,
    index: Mutex<Option<HashMap<String, u64>>>,
}

impl FsRunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn build_index(&self) -> Result<HashMap<String, u64>, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        let mut index = HashMap::new();
        let mut offset = 0u64;
        for line in content.split_inclusive('\n') {
            let start = offset;
            offset += line.len() as u64;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(line) {
                Ok(value) => {
                    if let Some(plan_id) = value.get("planId").and_then(|v| v.as_str()) {
                        index.insert(plan_id.to_string(), start);
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "Skipping unreadable run record");
                }
            }
        }
        tracing::debug!(path = %self.path.display(), plans = index.len(), "Indexed run log");
        Ok(index)
    }

    async fn read_line_at(&self, offset: u64) -> Result<serde_json::Value, StoreError> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut line = String::new();
        BufReader::new(file).read_line(&mut line).await?;
        Ok(serde_json::from_str(&line)?)
    }
}

#[async_trait]
impl RunStore for FsRunStore {
    async fn append(&self, record: &RunRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&redacted(record)?)?;
        line.push(b'\n');

        let mut index = self.index.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let offset = file.metadata().await?.len();
        file.write_all(&line).await?;
        file.flush().await?;
        if let Some(index) = index.as_mut() {
            index.insert(record.plan_id.clone(), offset);
        }
        Ok(())
    }

    async fn latest(&self, plan_id: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let mut guard = self.index.lock().await;
        if guard.is_none() {
            *guard = Some(self.build_index().await?);
        }
        let Some(offset) = guard.as_ref().and_then(|index| index.get(plan_id)).copied() else {
            return Ok(None);
        };
        self.read_line_at(offset).await.map(Some)
    }
}

/// In-memory store for tests and `ironplan run`.
#[derive(Default)]
pub struct MemoryRunStore {
    records: Mutex<Vec<serde_json::Value>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<serde_json::Value> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn append(&self, record: &RunRecord) -> Result<(), StoreError> {
        let value = redacted(record)?;
        self.records.lock().await.push(value);
        Ok(())
    }

    async fn latest(&self, plan_id: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .rev()
            .find(|v| v.get("planId").and_then(|p| p.as_str()) == Some(plan_id))
            .cloned())
    }
}
