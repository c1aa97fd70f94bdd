//! Content Fingerprint Service (C1): the file-I/O wrapper around
//! `citeloom_core::model::ContentFingerprint`. Pure and deterministic given
//! the same file contents and policy versions; the only I/O is the file read
//! and stat.

use citeloom_core::model::ContentFingerprint;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FingerprintComputeError {
    #[error("io error reading {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("fingerprint construction failed: {0}")]
    Invalid(#[from] citeloom_core::model::FingerprintError),
}

impl citeloom_core::error::CiteloomError for FingerprintComputeError {
    fn error_code(&self) -> citeloom_core::error::ErrorCode {
        use citeloom_core::error::ErrorCode;
        match self {
            FingerprintComputeError::Io { .. } => ErrorCode::Internal,
            FingerprintComputeError::Invalid(_) => ErrorCode::InvalidArgument,
        }
    }
}

/// Reads at most `citeloom_core::model::FINGERPRINT_PREVIEW_BYTES` from the
/// start of `path`, stats the file for size and mtime, and computes the
/// content hash over that preview window (§4.1).
pub fn compute(
    path: &Path,
    embedding_model: &str,
    chunking_policy_version: &str,
    embedding_policy_version: &str,
) -> Result<ContentFingerprint, FingerprintComputeError> {
    let io_err = |source: std::io::Error| FingerprintComputeError::Io {
        path: path.display().to_string(),
        source,
    };

    let metadata = std::fs::metadata(path).map_err(io_err)?;
    let file_size = metadata.len();
    let mtime: chrono::DateTime<chrono::Utc> = metadata.modified().map_err(io_err)?.into();

    let mut file = std::fs::File::open(path).map_err(io_err)?;
    let mut buf = vec![0u8; citeloom_core::model::FINGERPRINT_PREVIEW_BYTES];
    let mut total_read = 0;
    loop {
        let n = file.read(&mut buf[total_read..]).map_err(io_err)?;
        if n == 0 {
            break;
        }
        total_read += n;
        if total_read == buf.len() {
            break;
        }
    }
    buf.truncate(total_read);

    // Model and policy versions participate in the hash so that any of them
    // changing invalidates a stored fingerprint (§4.1).
    let mut hasher = Sha256::new();
    hasher.update(&buf);
    hasher.update(file_size.to_string().as_bytes());
    hasher.update(embedding_model.as_bytes());
    hasher.update(chunking_policy_version.as_bytes());
    hasher.update(embedding_policy_version.as_bytes());
    let content_hash = hex::encode(hasher.finalize());

    Ok(ContentFingerprint::new(
        content_hash,
        mtime.to_rfc3339(),
        file_size,
        embedding_model.to_string(),
        chunking_policy_version.to_string(),
        embedding_policy_version.to_string(),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn compute_is_deterministic_for_unchanged_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::File::create(&path).unwrap().write_all(b"hello world").unwrap();

        let a = compute(&path, "m1", "chunk-v1", "embed-v1").unwrap();
        let b = compute(&path, "m1", "chunk-v1", "embed-v1").unwrap();
        assert!(ContentFingerprint::is_unchanged(Some(&a), &b));
    }

    #[test]
    fn compute_changes_hash_when_content_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::File::create(&path).unwrap().write_all(b"hello world").unwrap();
        let a = compute(&path, "m1", "chunk-v1", "embed-v1").unwrap();

        std::fs::File::create(&path).unwrap().write_all(b"goodbye world").unwrap();
        let b = compute(&path, "m1", "chunk-v1", "embed-v1").unwrap();

        assert!(!ContentFingerprint::is_unchanged(Some(&a), &b));
    }

    #[test]
    fn compute_changes_hash_when_embedding_model_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::File::create(&path).unwrap().write_all(b"hello world").unwrap();

        let a = compute(&path, "m1", "chunk-v1", "embed-v1").unwrap();
        let b = compute(&path, "m2", "chunk-v1", "embed-v1").unwrap();
        assert_ne!(a.content_hash, b.content_hash);
    }
}
