//! Shared atomic-write helper: write to a sibling temp file, flush+fsync, then
//! rename over the target. Grounded on `SnapshotManager::create_snapshot`'s
//! temp-file-then-rename pattern; both the checkpoint store (C2) and the
//! download manifest (C3) need the identical durability contract so it lives
//! here once instead of being copied twice.

use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum AtomicWriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl citeloom_core::error::CiteloomError for AtomicWriteError {
    fn error_code(&self) -> citeloom_core::error::ErrorCode {
        citeloom_core::error::ErrorCode::Internal
    }
}

/// Writes `data` to `path` via a sibling `.tmp` file, fsyncs it, then renames
/// it into place. A partial write never replaces a previously valid file: the
/// rename only happens after the temp file's contents are durable. On any
/// failure before the rename, the temp file is removed.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), AtomicWriteError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let result = async {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, path).await?;
        Ok::<(), std::io::Error>(())
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_atomic_creates_parent_dirs_and_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/file.json");
        write_atomic(&path, b"hello").await.unwrap();
        let content = fs::read(&path).await.unwrap();
        assert_eq!(content, b"hello");
    }

    #[tokio::test]
    async fn write_atomic_leaves_no_tmp_file_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.json");
        write_atomic(&path, b"{}").await.unwrap();

        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["file.json".to_string()]);
    }

    #[tokio::test]
    async fn write_atomic_overwrites_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.json");
        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();
        let content = fs::read(&path).await.unwrap();
        assert_eq!(content, b"second");
    }
}
