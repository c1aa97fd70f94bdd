//! Capability set every Zotero backend (local SQLite snapshot, remote Web
//! API) implements, ported in meaning from
//! `application/ports/zotero_importer.py`'s `ZoteroImporterPort`.

use crate::types::{ZoteroAttachment, ZoteroCollection, ZoteroItem, ZoteroItemMetadata, ZoteroTag};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZoteroError {
    #[error("zotero client not initialized: {0}")]
    Connection(String),
    #[error("zotero api error: {0}")]
    Api(String),
    #[error("zotero rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimit { retry_after_secs: u64 },
    #[error("attachment not found: item={item_key} attachment={attachment_key}")]
    AttachmentNotFound { item_key: String, attachment_key: String },
    #[error("zotero database is locked by another writer")]
    DatabaseLocked,
    #[error("could not resolve attachment path, tried: {attempted:?}")]
    PathResolution { attempted: Vec<PathBuf> },
    #[error("no local adapter configured and strategy requires one")]
    LocalUnavailable,
}

/// Which backend actually resolved a downloaded attachment. Surfaced by
/// `download_attachment` so callers can record it (manifest's `source`
/// marker, §4.4) rather than assuming the strategy's nominal source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedSource {
    Local,
    Web,
}

impl citeloom_core::error::CiteloomError for ZoteroError {
    fn error_code(&self) -> citeloom_core::error::ErrorCode {
        use citeloom_core::error::ErrorCode;
        match self {
            ZoteroError::Connection(_) | ZoteroError::LocalUnavailable => ErrorCode::FailedPrecondition,
            ZoteroError::Api(_) => ErrorCode::Internal,
            ZoteroError::RateLimit { .. } => ErrorCode::ResourceExhausted,
            ZoteroError::AttachmentNotFound { .. } | ZoteroError::PathResolution { .. } => ErrorCode::NotFound,
            ZoteroError::DatabaseLocked => ErrorCode::FailedPrecondition,
        }
    }
}

/// The per-operation capability set routed over by C4 (§4.4).
#[async_trait]
pub trait ZoteroSource: Send + Sync {
    async fn list_collections(&self) -> Result<Vec<ZoteroCollection>, ZoteroError>;

    async fn get_collection_items(
        &self,
        collection_key: &str,
        include_subcollections: bool,
    ) -> Result<Vec<ZoteroItem>, ZoteroError>;

    async fn get_item_attachments(&self, item_key: &str) -> Result<Vec<ZoteroAttachment>, ZoteroError>;

    async fn download_attachment(
        &self,
        item_key: &str,
        attachment_key: &str,
        output_path: &Path,
    ) -> Result<(PathBuf, ResolvedSource), ZoteroError>;

    async fn get_item_metadata(&self, item_key: &str) -> Result<ZoteroItemMetadata, ZoteroError>;

    async fn list_tags(&self) -> Result<Vec<ZoteroTag>, ZoteroError>;

    async fn get_recent_items(&self, limit: usize) -> Result<Vec<ZoteroItem>, ZoteroError>;

    async fn find_collection_by_name(&self, name: &str) -> Result<Option<ZoteroCollection>, ZoteroError>;

    /// The reference manager's own cached full-text extraction for an item,
    /// if it keeps one (C5/§4.5, §4.8). Backends that don't cache full-text
    /// (the remote Web API) default to reporting none rather than erroring.
    async fn get_cached_fulltext(&self, _item_key: &str) -> Result<Option<String>, ZoteroError> {
        Ok(None)
    }
}

/// Implemented only by adapters that can answer "do I have this file" without
/// performing the actual read — the local reader's cheap probe ahead of the
/// router committing to a source for `download_attachment` (§4.4).
#[async_trait]
pub trait LocalResolutionProbe: Send + Sync {
    async fn can_resolve_locally(&self, attachment_key: &str) -> bool;
}
