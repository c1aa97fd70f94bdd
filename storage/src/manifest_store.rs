//! Download manifest (C3): the durable join key between Phase A (acquire) and
//! Phase B (process) of the ingestion orchestrator. Authoritative about where
//! each attachment's PDF lives on disk once downloaded. Durability reuses the
//! same atomic temp-file-then-rename contract as the checkpoint store (§4.3).

use crate::atomic::{write_atomic, AtomicWriteError};
use chrono::{DateTime, Utc};
use citeloom_core::model::{CitationMetadata, ContentFingerprint};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMarker {
    Local,
    Web,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Success,
    Failed,
}

/// One attachment belonging to a manifest item (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestAttachment {
    pub attachment_key: String,
    pub filename: String,
    /// Absolute path once `download_status == Success`.
    pub local_path: Option<String>,
    pub download_status: DownloadStatus,
    pub file_size: Option<u64>,
    pub error: Option<String>,
    pub source: SourceMarker,
    pub content_fingerprint: Option<ContentFingerprint>,
}

impl ManifestAttachment {
    pub fn pending(attachment_key: String, filename: String) -> Self {
        Self {
            attachment_key,
            filename,
            local_path: None,
            download_status: DownloadStatus::Pending,
            file_size: None,
            error: None,
            source: SourceMarker::Web,
            content_fingerprint: None,
        }
    }

    pub fn mark_success(&mut self, local_path: String, file_size: u64, source: SourceMarker) {
        self.local_path = Some(local_path);
        self.file_size = Some(file_size);
        self.source = source;
        self.download_status = DownloadStatus::Success;
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.download_status = DownloadStatus::Failed;
        self.error = Some(error);
    }

    pub fn is_pdf(&self) -> bool {
        self.filename.to_ascii_lowercase().ends_with(".pdf")
    }
}

/// One Zotero item and its attachments within a collection download (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestItem {
    pub item_key: String,
    pub title: String,
    pub metadata: Option<CitationMetadata>,
    pub attachments: Vec<ManifestAttachment>,
}

impl ManifestItem {
    pub fn new(item_key: String, title: String) -> Self {
        Self {
            item_key,
            title,
            metadata: None,
            attachments: Vec::new(),
        }
    }

    /// Replaces an existing attachment with the same key, or appends.
    pub fn add_attachment(&mut self, attachment: ManifestAttachment) {
        if let Some(existing) = self
            .attachments
            .iter_mut()
            .find(|a| a.attachment_key == attachment.attachment_key)
        {
            *existing = attachment;
        } else {
            self.attachments.push(attachment);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadManifest {
    pub collection_key: String,
    pub collection_name: String,
    pub download_time: DateTime<Utc>,
    pub items: Vec<ManifestItem>,
}

impl DownloadManifest {
    pub fn new(collection_key: String, collection_name: String, download_time: DateTime<Utc>) -> Self {
        Self {
            collection_key,
            collection_name,
            download_time,
            items: Vec::new(),
        }
    }

    /// Replaces an existing item with the same key, or appends.
    pub fn add_item(&mut self, item: ManifestItem) {
        if let Some(existing) = self.items.iter_mut().find(|i| i.item_key == item.item_key) {
            *existing = item;
        } else {
            self.items.push(item);
        }
    }

    pub fn get_item_by_key(&self, item_key: &str) -> Option<&ManifestItem> {
        self.items.iter().find(|i| i.item_key == item_key)
    }

    /// Writes a freshly-computed fingerprint back onto the named attachment so
    /// a future run's resume check (§4.12 step 3) has something to compare
    /// against. A no-op if the item/attachment isn't in the manifest.
    pub fn set_content_fingerprint(&mut self, item_key: &str, attachment_key: &str, fingerprint: ContentFingerprint) {
        if let Some(item) = self.items.iter_mut().find(|i| i.item_key == item_key) {
            if let Some(attachment) = item.attachments.iter_mut().find(|a| a.attachment_key == attachment_key) {
                attachment.content_fingerprint = Some(fingerprint);
            }
        }
    }

    pub fn get_pdf_attachments(&self) -> Vec<(&ManifestItem, &ManifestAttachment)> {
        self.items
            .iter()
            .flat_map(|item| item.attachments.iter().map(move |a| (item, a)))
            .filter(|(_, a)| a.is_pdf())
            .collect()
    }

    pub fn get_successful_downloads(&self) -> Vec<(&ManifestItem, &ManifestAttachment)> {
        self.items
            .iter()
            .flat_map(|item| item.attachments.iter().map(move |a| (item, a)))
            .filter(|(_, a)| a.download_status == DownloadStatus::Success)
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum ManifestStoreError {
    #[error("atomic write failed: {0}")]
    Write(#[from] AtomicWriteError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest JSON is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl citeloom_core::error::CiteloomError for ManifestStoreError {
    fn error_code(&self) -> citeloom_core::error::ErrorCode {
        citeloom_core::error::ErrorCode::Internal
    }
}

/// Persists manifests at `<downloads_dir>/<collection_key>/manifest.json`.
pub struct ManifestStore {
    downloads_dir: PathBuf,
}

impl ManifestStore {
    pub fn new(downloads_dir: impl AsRef<Path>) -> Self {
        Self {
            downloads_dir: downloads_dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, collection_key: &str) -> PathBuf {
        self.downloads_dir.join(collection_key).join("manifest.json")
    }

    pub async fn save(&self, manifest: &DownloadManifest) -> Result<(), ManifestStoreError> {
        let data = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.path_for(&manifest.collection_key), &data).await?;
        Ok(())
    }

    pub async fn load(&self, collection_key: &str) -> Result<Option<DownloadManifest>, ManifestStoreError> {
        let path = self.path_for(collection_key);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read(&path).await?;
        Ok(Some(serde_json::from_slice(&data)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_item() -> ManifestItem {
        let mut item = ManifestItem::new("item1".to_string(), "A Paper".to_string());
        let mut att = ManifestAttachment::pending("att1".to_string(), "a.pdf".to_string());
        att.mark_success("/var/downloads/c1/att1.pdf".to_string(), 1024, SourceMarker::Local);
        item.add_attachment(att);
        item
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let mut manifest = DownloadManifest::new("c1".to_string(), "Collection One".to_string(), Utc::now());
        manifest.add_item(sample_item());

        store.save(&manifest).await.unwrap();
        let loaded = store.load("c1").await.unwrap().unwrap();
        assert_eq!(loaded.items.len(), 1);
        assert_eq!(loaded.get_pdf_attachments().len(), 1);
    }

    #[test]
    fn add_item_replaces_by_key() {
        let mut manifest = DownloadManifest::new("c1".to_string(), "Collection One".to_string(), Utc::now());
        let mut failing = ManifestItem::new("item1".to_string(), "A Paper".to_string());
        failing.add_attachment({
            let mut att = ManifestAttachment::pending("att1".to_string(), "a.pdf".to_string());
            att.mark_failed("network error".to_string());
            att
        });
        manifest.add_item(failing);
        assert_eq!(manifest.get_successful_downloads().len(), 0);

        manifest.add_item(sample_item());
        assert_eq!(manifest.items.len(), 1, "same item_key replaces in place");
        assert_eq!(manifest.get_successful_downloads().len(), 1);
    }

    #[test]
    fn get_item_by_key_finds_the_item() {
        let mut manifest = DownloadManifest::new("c1".to_string(), "Collection One".to_string(), Utc::now());
        manifest.add_item(sample_item());
        assert!(manifest.get_item_by_key("item1").is_some());
        assert!(manifest.get_item_by_key("missing").is_none());
    }
}
