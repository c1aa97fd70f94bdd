//! Durable checkpoint store (C2): atomic save/load for `IngestionCheckpoint`,
//! keyed by correlation id. Grounded on `snapshot.rs`'s atomic temp-file-then-
//! rename idiom, now via the shared `crate::atomic` helper.

use crate::atomic::{write_atomic, AtomicWriteError};
use citeloom_core::checkpoint::{CheckpointError, IngestionCheckpoint};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointStoreError {
    #[error("atomic write failed: {0}")]
    Write(#[from] AtomicWriteError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint JSON is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("checkpoint failed validation: {0}")]
    Invalid(#[from] CheckpointError),
}

impl citeloom_core::error::CiteloomError for CheckpointStoreError {
    fn error_code(&self) -> citeloom_core::error::ErrorCode {
        use citeloom_core::error::ErrorCode;
        match self {
            CheckpointStoreError::Write(_) | CheckpointStoreError::Io(_) => ErrorCode::Internal,
            CheckpointStoreError::Corrupt(_) => ErrorCode::Internal,
            CheckpointStoreError::Invalid(_) => ErrorCode::InvalidArgument,
        }
    }
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, correlation_id: &str) -> PathBuf {
        self.dir.join(format!("{correlation_id}.json"))
    }

    /// Atomic save: serialize, write to a sibling temp file, fsync, rename.
    /// A partial write never replaces a previously valid checkpoint (§4.2).
    pub async fn save(&self, ckpt: &IngestionCheckpoint) -> Result<(), CheckpointStoreError> {
        ckpt.validate()?;
        let data = serde_json::to_vec_pretty(ckpt)?;
        write_atomic(&self.path_for(&ckpt.correlation_id), &data).await?;
        Ok(())
    }

    pub async fn load(&self, correlation_id: &str) -> Result<Option<IngestionCheckpoint>, CheckpointStoreError> {
        let path = self.path_for(correlation_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read(&path).await?;
        let ckpt: IngestionCheckpoint = serde_json::from_slice(&data)?;
        ckpt.validate()?;
        Ok(Some(ckpt))
    }

    pub async fn exists(&self, correlation_id: &str) -> bool {
        self.path_for(correlation_id).exists()
    }

    pub fn validate(ckpt: &IngestionCheckpoint) -> Result<(), CheckpointStoreError> {
        ckpt.validate().map_err(CheckpointStoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample() -> IngestionCheckpoint {
        IngestionCheckpoint::new(
            "11111111-1111-1111-1111-111111111111".to_string(),
            "citeloom/demo".to_string(),
            Some("ABCDEF12".to_string()),
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let ckpt = sample();

        store.save(&ckpt).await.unwrap();
        let loaded = store.load(&ckpt.correlation_id).await.unwrap().unwrap();
        assert_eq!(loaded.correlation_id, ckpt.correlation_id);
        assert_eq!(loaded.project_id, ckpt.project_id);
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load("nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_json_surfaces_as_error_not_silently_dropped() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = dir.path().join("11111111-1111-1111-1111-111111111111.json");
        tokio::fs::write(&path, b"{ not valid json").await.unwrap();

        let result = store.load("11111111-1111-1111-1111-111111111111").await;
        assert!(matches!(result, Err(CheckpointStoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn exists_reflects_disk_state() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let ckpt = sample();
        assert!(!store.exists(&ckpt.correlation_id).await);
        store.save(&ckpt).await.unwrap();
        assert!(store.exists(&ckpt.correlation_id).await);
    }
}
