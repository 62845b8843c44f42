use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

/// Replace `path` with `content` so that readers see either the old file or
/// the complete new one.
///
/// The bytes go to a fresh sibling temp file first, are synced, and the temp
/// file is renamed over the target. The directory is synced after the rename
/// so the swap survives a crash or the restart that follows. On failure the
/// temp file is removed.
pub async fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let tmp = temp_sibling(path);
    let result = write_and_rename(&tmp, path, content).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

async fn write_and_rename(tmp: &Path, path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp)
        .await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(tmp, path).await?;
    sync_parent_dir(&parent_dir(path)).await
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(unix)]
async fn sync_parent_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_parent_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "source".to_string());
    let tmp_name = format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple());
    parent_dir(path).join(tmp_name)
}
