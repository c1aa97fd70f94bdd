//! Domain value objects shared across the workspace: chunks, citation metadata and
//! content fingerprints (§3). Ported in meaning from the original Python domain
//! models; field sets and invariants match, naming and structure do not.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// A 1-indexed, inclusive page range within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpan {
    pub start: u32,
    pub end: u32,
}

impl PageSpan {
    pub fn new(start: u32, end: u32) -> Result<Self, ModelError> {
        if start > end {
            return Err(ModelError::InvalidPageSpan { start, end });
        }
        Ok(Self { start, end })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("invalid page span: start ({start}) > end ({end})")]
    InvalidPageSpan { start: u32, end: u32 },
    #[error("chunk_idx must be >= 0, got {0}")]
    InvalidChunkIdx(i64),
    #[error("signal_to_noise_ratio must be >= 0.0 if provided, got {0}")]
    InvalidSignalToNoise(f32),
    #[error("citation metadata must carry at least one of doi/url")]
    MissingDoiAndUrl,
    #[error("citation metadata authors must be non-empty")]
    EmptyAuthors,
    #[error("citation metadata year must be > 0 if provided, got {0}")]
    InvalidYear(i32),
}

impl crate::error::CiteloomError for ModelError {
    fn error_code(&self) -> crate::error::ErrorCode {
        crate::error::ErrorCode::InvalidArgument
    }
}

/// Deterministic chunk id: SHA-256 over `doc_id:location_key:embedding_model_id:chunk_idx`,
/// truncated to 16 hex chars. `location_key` is the pipe-joined `section_path` when
/// non-empty, otherwise `p<start>-<end>` from `page_span` (§3, testable property 1).
pub fn generate_chunk_id(
    doc_id: &str,
    page_span: PageSpan,
    section_path: &[String],
    embedding_model_id: &str,
    chunk_idx: u32,
) -> String {
    let location_key = if section_path.is_empty() {
        format!("p{}-{}", page_span.start, page_span.end)
    } else {
        section_path.join("|")
    };
    let id_string = format!(
        "{}:{}:{}:{}",
        doc_id, location_key, embedding_model_id, chunk_idx
    );
    let digest = Sha256::digest(id_string.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// A semantically meaningful segment of a document, immutable after construction (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    pub text: String,
    pub page_span: PageSpan,
    pub section_heading: Option<String>,
    pub section_path: Vec<String>,
    pub chunk_idx: u32,
    pub token_count: Option<u32>,
    pub signal_to_noise_ratio: Option<f32>,
}

impl Chunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        doc_id: String,
        text: String,
        page_span: PageSpan,
        section_heading: Option<String>,
        section_path: Vec<String>,
        chunk_idx: u32,
        embedding_model_id: &str,
        token_count: Option<u32>,
        signal_to_noise_ratio: Option<f32>,
    ) -> Result<Self, ModelError> {
        if let Some(ratio) = signal_to_noise_ratio {
            if ratio < 0.0 {
                return Err(ModelError::InvalidSignalToNoise(ratio));
            }
        }
        let id = generate_chunk_id(
            &doc_id,
            page_span,
            &section_path,
            embedding_model_id,
            chunk_idx,
        );
        Ok(Self {
            id,
            doc_id,
            text,
            page_span,
            section_heading,
            section_path,
            chunk_idx,
            token_count,
            signal_to_noise_ratio,
        })
    }
}

/// Bibliographic metadata resolved for a document (§3, C7 output shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationMetadata {
    pub citekey: Option<String>,
    pub title: String,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub doi: Option<String>,
    pub url: Option<String>,
    pub tags: BTreeSet<String>,
    pub collections: BTreeSet<String>,
    /// Two-letter language code (e.g. "en", "de", "fr").
    pub language: Option<String>,
}

impl CitationMetadata {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.authors.is_empty() {
            return Err(ModelError::EmptyAuthors);
        }
        if self.doi.is_none() && self.url.is_none() {
            return Err(ModelError::MissingDoiAndUrl);
        }
        if let Some(year) = self.year {
            if year <= 0 {
                return Err(ModelError::InvalidYear(year));
            }
        }
        Ok(())
    }
}

/// Composite fingerprint used for deduplication and cache invalidation (§3, §4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentFingerprint {
    pub content_hash: String,
    /// ISO-8601 file modification time.
    pub file_mtime: String,
    pub file_size: u64,
    pub embedding_model: String,
    pub chunking_policy_version: String,
    pub embedding_policy_version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("content_hash must be a non-empty hex string of >= 8 chars")]
    InvalidContentHash,
    #[error("file_mtime must be a valid ISO-8601 timestamp: {0}")]
    InvalidMtime(String),
    #[error("embedding_model must be non-empty")]
    EmptyEmbeddingModel,
    #[error("chunking_policy_version must be non-empty")]
    EmptyChunkingPolicyVersion,
    #[error("embedding_policy_version must be non-empty")]
    EmptyEmbeddingPolicyVersion,
}

impl crate::error::CiteloomError for FingerprintError {
    fn error_code(&self) -> crate::error::ErrorCode {
        crate::error::ErrorCode::InvalidArgument
    }
}

/// Size of the file-content preview window hashed into `content_hash` (§3, §4.1).
pub const FINGERPRINT_PREVIEW_BYTES: usize = 1024 * 1024;

impl ContentFingerprint {
    pub fn new(
        content_hash: String,
        file_mtime: String,
        file_size: u64,
        embedding_model: String,
        chunking_policy_version: String,
        embedding_policy_version: String,
    ) -> Result<Self, FingerprintError> {
        if content_hash.len() < 8 || !content_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FingerprintError::InvalidContentHash);
        }
        chrono::DateTime::parse_from_rfc3339(&file_mtime)
            .map_err(|e| FingerprintError::InvalidMtime(e.to_string()))?;
        if embedding_model.is_empty() {
            return Err(FingerprintError::EmptyEmbeddingModel);
        }
        if chunking_policy_version.is_empty() {
            return Err(FingerprintError::EmptyChunkingPolicyVersion);
        }
        if embedding_policy_version.is_empty() {
            return Err(FingerprintError::EmptyEmbeddingPolicyVersion);
        }
        Ok(Self {
            content_hash,
            file_mtime,
            file_size,
            embedding_model,
            chunking_policy_version,
            embedding_policy_version,
        })
    }

    /// Hash+mtime+size equality used for "document unchanged" (§3, testable property 3).
    pub fn matches(&self, other: &ContentFingerprint, check_metadata: bool) -> bool {
        if self.content_hash != other.content_hash {
            return false;
        }
        if check_metadata && (self.file_mtime != other.file_mtime || self.file_size != other.file_size) {
            return false;
        }
        true
    }

    pub fn is_unchanged(stored: Option<&ContentFingerprint>, computed: &ContentFingerprint) -> bool {
        match stored {
            None => false,
            Some(stored) => stored.matches(computed, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_is_deterministic() {
        let span = PageSpan::new(3, 4).unwrap();
        let a = generate_chunk_id("doc1", span, &[], "m1", 0);
        let b = generate_chunk_id("doc1", span, &[], "m1", 0);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn chunk_id_changes_with_each_input() {
        let span = PageSpan::new(3, 4).unwrap();
        let base = generate_chunk_id("doc1", span, &[], "m1", 0);
        assert_ne!(base, generate_chunk_id("doc2", span, &[], "m1", 0));
        assert_ne!(
            base,
            generate_chunk_id("doc1", PageSpan::new(5, 6).unwrap(), &[], "m1", 0)
        );
        assert_ne!(base, generate_chunk_id("doc1", span, &[], "m2", 0));
        assert_ne!(base, generate_chunk_id("doc1", span, &[], "m1", 1));
        let with_path = generate_chunk_id(
            "doc1",
            span,
            &["Intro".to_string(), "Background".to_string()],
            "m1",
            0,
        );
        assert_ne!(base, with_path);
    }

    #[test]
    fn section_path_wins_over_page_span_when_present() {
        let span_a = PageSpan::new(1, 1).unwrap();
        let span_b = PageSpan::new(9, 9).unwrap();
        let path = vec!["Intro".to_string()];
        let a = generate_chunk_id("doc1", span_a, &path, "m1", 0);
        let b = generate_chunk_id("doc1", span_b, &path, "m1", 0);
        assert_eq!(a, b, "page_span must not participate when section_path is non-empty");
    }

    #[test]
    fn fingerprint_collision_protection() {
        let a = ContentFingerprint::new(
            "abcdef0123456789".to_string(),
            "2024-01-01T00:00:00+00:00".to_string(),
            100,
            "m1".to_string(),
            "1.0".to_string(),
            "1.0".to_string(),
        )
        .unwrap();
        let b = ContentFingerprint::new(
            "abcdef0123456789".to_string(),
            "2024-01-02T00:00:00+00:00".to_string(),
            100,
            "m1".to_string(),
            "1.0".to_string(),
            "1.0".to_string(),
        )
        .unwrap();
        assert!(!a.matches(&b, true));
        assert!(a.matches(&b, false));
    }
}
