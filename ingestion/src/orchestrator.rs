//! Ingestion Orchestrator (C12): Phase A acquires attachments from a Zotero
//! collection into a download manifest; Phase B chunks, embeds, and indexes
//! each successful download, checkpointing after every stage transition so a
//! run is resumable. Ported in meaning from the teacher's
//! `IngestionPipeline` (idempotency-keyed single-document flow), generalized
//! to the two-phase batch shape of §4.12.

use crate::chunker::{ChunkerPipeline, ChunkingInput, HeadingTree};
use crate::fingerprint;
use crate::fulltext::{self, DocumentConverter};
use chrono::Utc;
use citeloom_core::audit::{AuditEvent, AuditSink};
use citeloom_core::checkpoint::{DocumentCheckpoint, IngestionCheckpoint, Stage};
use citeloom_core::model::{CitationMetadata, ContentFingerprint};
use citeloom_embedder::EmbedderPool;
use citeloom_jobs::WorkerPool;
use citeloom_storage::checkpoint_store::CheckpointStore;
use citeloom_storage::manifest_store::{DownloadManifest, DownloadStatus, ManifestAttachment, ManifestItem, ManifestStore, SourceMarker};
use citeloom_storage::vector_index::{ChunkUpsert, VectorIndexGateway, VectorPayload};
use citeloom_zotero::metadata::{extract_citekey_from_extra, from_item_metadata};
use citeloom_zotero::{ResolvedSource, ZoteroError, ZoteroSource};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("zotero error: {0}")]
    Zotero(#[from] ZoteroError),
    #[error("checkpoint store error: {0}")]
    CheckpointStore(#[from] citeloom_storage::checkpoint_store::CheckpointStoreError),
    #[error("manifest store error: {0}")]
    ManifestStore(#[from] citeloom_storage::manifest_store::ManifestStoreError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] citeloom_core::checkpoint::CheckpointError),
}

impl citeloom_core::error::CiteloomError for OrchestratorError {
    fn error_code(&self) -> citeloom_core::error::ErrorCode {
        citeloom_core::error::ErrorCode::Internal
    }
}

const BATCH_LOG_INTERVAL: usize = 15;
const MAX_FILENAME_LEN: usize = 200;
const LARGE_PDF_PAGE_THRESHOLD: usize = 1_000;
const CONVERSION_WINDOW_PAGES: usize = 20;

pub struct TagFilter {
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
}

impl TagFilter {
    pub fn matches(&self, tags: &[String]) -> bool {
        let lower: Vec<String> = tags.iter().map(|t| t.to_ascii_lowercase()).collect();

        if !self.exclude_tags.is_empty()
            && self.exclude_tags.iter().any(|ex| lower.iter().any(|t| t.contains(&ex.to_ascii_lowercase())))
        {
            return false;
        }

        if self.include_tags.is_empty() {
            return true;
        }
        self.include_tags.iter().any(|inc| lower.iter().any(|t| t.contains(&inc.to_ascii_lowercase())))
    }
}

/// Strips path separators and reserved characters, truncates to
/// `MAX_FILENAME_LEN`, and de-collides against `seen` by suffix counter (§4.12).
pub fn sanitize_filename(raw: &str, seen: &mut std::collections::HashSet<String>) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') { '_' } else { c })
        .collect();
    let truncated: String = cleaned.chars().take(MAX_FILENAME_LEN).collect();

    if !seen.contains(&truncated) {
        seen.insert(truncated.clone());
        return truncated;
    }

    let (stem, ext) = match truncated.rsplit_once('.') {
        Some((s, e)) => (s.to_string(), format!(".{e}")),
        None => (truncated.clone(), String::new()),
    };
    let mut counter = 1;
    loop {
        let candidate = format!("{stem}_{counter}{ext}");
        if !seen.contains(&candidate) {
            seen.insert(candidate.clone());
            return candidate;
        }
        counter += 1;
    }
}

pub struct IngestionOrchestrator {
    pub zotero: Arc<dyn ZoteroSource>,
    pub checkpoints: CheckpointStore,
    pub manifests: ManifestStore,
    pub vector_index: Arc<VectorIndexGateway>,
    pub embedder: Arc<EmbedderPool>,
    pub chunker: Arc<ChunkerPipeline>,
    pub converter: Arc<dyn DocumentConverter>,
    pub audit: Arc<dyn AuditSink>,
    pub project_id: String,
    pub downloads_dir: PathBuf,
    pub concurrency: usize,
    pub embedding_model_id: String,
    pub chunking_policy_version: String,
    pub embedding_policy_version: String,
}

impl IngestionOrchestrator {
    /// Phase A: walks the collection through the router, filters by tag,
    /// downloads each attachment, and serializes the resulting manifest.
    pub async fn acquire(
        &self,
        collection_key: &str,
        include_subcollections: bool,
        tag_filter: &TagFilter,
    ) -> Result<DownloadManifest, OrchestratorError> {
        let collection = self
            .zotero
            .find_collection_by_name(collection_key)
            .await
            .ok()
            .flatten();
        let collection_name = collection.map(|c| c.name).unwrap_or_else(|| collection_key.to_string());

        let items = self.zotero.get_collection_items(collection_key, include_subcollections).await?;
        let retained: Vec<_> = items
            .into_iter()
            .filter(|item| tag_filter.matches(&item.data.tags))
            .collect();

        let manifest = Arc::new(Mutex::new(DownloadManifest::new(
            collection_key.to_string(),
            collection_name,
            Utc::now(),
        )));
        let collection_dir = self.downloads_dir.join(collection_key);
        let seen_filenames = Arc::new(Mutex::new(std::collections::HashSet::new()));
        let downloaded = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let pool = {
            let zotero = self.zotero.clone();
            let manifest = manifest.clone();
            let collection_dir = collection_dir.clone();
            let seen_filenames = seen_filenames.clone();
            let downloaded = downloaded.clone();

            WorkerPool::spawn(self.concurrency, 64, move |item_key: String| {
                let zotero = zotero.clone();
                let manifest = manifest.clone();
                let collection_dir = collection_dir.clone();
                let seen_filenames = seen_filenames.clone();
                let downloaded = downloaded.clone();

                async move {
                    let attachments = match zotero.get_item_attachments(&item_key).await {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(item_key, error = %e, "failed to list attachments");
                            return;
                        }
                    };
                    let metadata = zotero.get_item_metadata(&item_key).await.unwrap_or_default();
                    let citekey = metadata.extra.as_deref().and_then(extract_citekey_from_extra);
                    let citation_metadata = from_item_metadata(&metadata, citekey);

                    let mut manifest_attachments = Vec::new();
                    for attachment in attachments.into_iter().filter(|a| a.is_pdf()) {
                        let filename = {
                            let mut seen = seen_filenames.lock().await;
                            sanitize_filename(&attachment.filename, &mut seen)
                        };
                        let output_path = collection_dir.join(&filename);

                        let (status, local_path, error, source) =
                            match zotero.download_attachment(&item_key, &attachment.key, &output_path).await {
                                Ok((path, ResolvedSource::Local)) => {
                                    (DownloadStatus::Success, Some(path.display().to_string()), None, SourceMarker::Local)
                                }
                                Ok((path, ResolvedSource::Web)) => {
                                    (DownloadStatus::Success, Some(path.display().to_string()), None, SourceMarker::Web)
                                }
                                Err(e) => (DownloadStatus::Failed, None, Some(e.to_string()), SourceMarker::Web),
                            };

                        manifest_attachments.push(ManifestAttachment {
                            attachment_key: attachment.key.clone(),
                            filename,
                            local_path,
                            download_status: status,
                            file_size: None,
                            error,
                            source,
                            content_fingerprint: None,
                        });

                        let count = downloaded.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                        if count % BATCH_LOG_INTERVAL == 0 {
                            info!(downloaded = count, "ingestion acquire progress");
                        }
                    }

                    let mut manifest = manifest.lock().await;
                    manifest.add_item(ManifestItem {
                        item_key,
                        title: metadata.title.clone(),
                        metadata: Some(citation_metadata),
                        attachments: manifest_attachments,
                    });
                }
            })
        };

        for item in retained {
            let _ = pool.submit(item.key).await;
        }
        pool.join().await;

        let manifest = Arc::try_unwrap(manifest).map_err(|_| ()).unwrap().into_inner();
        self.manifests.save(&manifest).await?;
        Ok(manifest)
    }

    /// Phase B: processes each successfully-downloaded attachment through
    /// fingerprinting, full-text resolution, chunking, embedding, and upsert,
    /// checkpointing after every stage transition.
    pub async fn process(
        &self,
        manifest: &mut DownloadManifest,
        correlation_id: &str,
        collection_key: Option<&str>,
    ) -> Result<IngestionCheckpoint, OrchestratorError> {
        let now = Utc::now();
        let mut checkpoint = self
            .checkpoints
            .load(correlation_id)
            .await?
            .unwrap_or(IngestionCheckpoint::new(
                correlation_id.to_string(),
                self.project_id.clone(),
                collection_key.map(String::from),
                now,
            )?);

        let collection = collection_name(&self.project_id);
        self.vector_index.ensure_collection(&collection, self.default_dense_dim(), false).await.ok();

        let work: Vec<(ManifestItem, ManifestAttachment)> = manifest
            .get_successful_downloads()
            .into_iter()
            .map(|(item, attachment)| (item.clone(), attachment.clone()))
            .collect();

        for (item, attachment) in &work {
            let Some(local_path) = &attachment.local_path else { continue };
            let path = Path::new(local_path);

            let already_completed = checkpoint
                .documents
                .iter()
                .find(|d| d.path == *local_path)
                .map(|d| d.status == Stage::Completed)
                .unwrap_or(false);

            let fingerprint = match fingerprint::compute(
                path,
                &self.embedding_model_id,
                &self.chunking_policy_version,
                &self.embedding_policy_version,
            ) {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %local_path, error = %e, "fingerprint computation failed");
                    self.mark_failed(&mut checkpoint, local_path, &e.to_string(), now)?;
                    continue;
                }
            };

            if already_completed && ContentFingerprint::is_unchanged(attachment.content_fingerprint.as_ref(), &fingerprint) {
                info!(path = %local_path, "unchanged since last completed run, skipping");
                continue;
            }

            manifest.set_content_fingerprint(&item.item_key, &attachment.attachment_key, fingerprint.clone());
            self.manifests.save(manifest).await?;

            let mut doc = checkpoint
                .documents
                .iter()
                .find(|d| d.path == *local_path)
                .cloned()
                .unwrap_or(DocumentCheckpoint::new(local_path.clone(), now)?);
            doc.zotero_item_key = Some(item.item_key.clone());
            doc.zotero_attachment_key = Some(attachment.attachment_key.clone());
            doc.mark_stage(Stage::Converting, Utc::now());
            checkpoint.add_document_checkpoint(doc, Utc::now())?;
            self.checkpoints.save(&checkpoint).await?;

            let result = self
                .process_document(
                    path,
                    &item.item_key,
                    &attachment.attachment_key,
                    item.metadata.as_ref(),
                    &mut checkpoint,
                )
                .await;

            let mut doc = checkpoint
                .documents
                .iter()
                .find(|d| d.path == *local_path)
                .cloned()
                .expect("document checkpoint was just inserted above");

            match result {
                Ok(chunks_written) => {
                    doc.mark_completed(chunks_written, item.item_key.clone(), Utc::now())?;
                    checkpoint.add_document_checkpoint(doc, Utc::now())?;
                    self.checkpoints.save(&checkpoint).await?;

                    let _ = self.audit.record(AuditEvent {
                        sequence: 0,
                        correlation_id: correlation_id.to_string(),
                        doc_id: item.item_key.clone(),
                        project_id: self.project_id.clone(),
                        source_path: local_path.clone(),
                        chunks_written,
                        documents_processed: 1,
                        duration_seconds: 0.0,
                        embed_model: self.embedding_model_id.clone(),
                        warnings: vec![],
                        timestamp: Utc::now(),
                    });
                }
                Err(e) => {
                    warn!(path = %local_path, error = %e, "document processing failed");
                    doc.mark_failed(e.to_string(), Utc::now())?;
                    checkpoint.add_document_checkpoint(doc, Utc::now())?;
                    self.checkpoints.save(&checkpoint).await?;
                }
            }
        }

        Ok(checkpoint)
    }

    fn mark_failed(&self, checkpoint: &mut IngestionCheckpoint, path: &str, error: &str, now: chrono::DateTime<Utc>) -> Result<(), OrchestratorError> {
        let mut doc = checkpoint
            .documents
            .iter()
            .find(|d| d.path == path)
            .cloned()
            .unwrap_or(DocumentCheckpoint::new(path.to_string(), now)?);
        doc.mark_failed(error.to_string(), now)?;
        checkpoint.add_document_checkpoint(doc, now)?;
        Ok(())
    }

    fn default_dense_dim(&self) -> usize {
        768
    }

    fn page_map_for(conversion: &fulltext::ConversionResult) -> BTreeMap<u32, (usize, usize)> {
        let mut page_map = BTreeMap::new();
        let mut offset = 0usize;
        for (&page, text) in &conversion.pages {
            page_map.insert(page, (offset, offset + text.len()));
            offset += text.len() + 2;
        }
        page_map
    }

    /// Chunks, embeds, and upserts one resolved span of text (either a whole
    /// small document, or one window of a large one).
    async fn embed_and_upsert(
        &self,
        item_key: &str,
        attachment_key: &str,
        path: &Path,
        citation: Option<&CitationMetadata>,
        text: &str,
        conversion: &fulltext::ConversionResult,
    ) -> Result<u64, anyhow::Error> {
        let page_map = Self::page_map_for(conversion);
        let input = ChunkingInput {
            doc_id: item_key,
            text,
            headings: &HeadingTree::default(),
            page_map: &page_map,
            embedding_model_id: &self.embedding_model_id,
        };
        let chunks = self.chunker.chunk(&input, conversion).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        if chunks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts, &self.embedding_model_id).await?;

        let source_path = path.display().to_string();
        let collection = collection_name(&self.project_id);

        let upserts: Vec<ChunkUpsert> = chunks
            .into_iter()
            .zip(vectors.into_iter())
            .map(|(chunk, dense_vector)| {
                let mut payload = VectorPayload::from_chunk(&chunk, &source_path, &self.embedding_model_id, citation);
                payload.zotero_item_key = Some(item_key.to_string());
                payload.zotero_attachment_key = Some(attachment_key.to_string());
                ChunkUpsert { chunk, dense_vector, sparse_vector: None, payload }
            })
            .collect();

        let chunks_written = upserts.len() as u64;
        self.vector_index
            .upsert(&collection, &self.project_id, &self.embedding_model_id, None, upserts)
            .await?;

        Ok(chunks_written)
    }

    async fn process_document(
        &self,
        path: &Path,
        item_key: &str,
        attachment_key: &str,
        citation: Option<&CitationMetadata>,
        checkpoint: &mut IngestionCheckpoint,
    ) -> Result<u64, anyhow::Error> {
        let conversion = self.converter.convert(path).ok_or_else(|| anyhow::anyhow!("conversion failed"))?;
        let cached_text = self.zotero.get_cached_fulltext(item_key).await.unwrap_or(None);

        if conversion.pages.len() >= LARGE_PDF_PAGE_THRESHOLD {
            return self
                .process_windowed(path, item_key, attachment_key, citation, &conversion, cached_text.as_deref(), checkpoint, Utc::now())
                .await;
        }

        let resolved = fulltext::resolve(attachment_key, cached_text.as_deref(), Some(&conversion), true, 50)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        self.embed_and_upsert(item_key, attachment_key, path, citation, &resolved.text, &conversion).await
    }

    /// For very large documents, chunking/embedding/upsert happens in bounded
    /// page-range windows, each checkpointed in turn, so a crash mid-document
    /// only reprocesses from the last completed window, not from scratch
    /// (§4.12).
    #[allow(clippy::too_many_arguments)]
    async fn process_windowed(
        &self,
        path: &Path,
        item_key: &str,
        attachment_key: &str,
        citation: Option<&CitationMetadata>,
        conversion: &fulltext::ConversionResult,
        cached_text: Option<&str>,
        checkpoint: &mut IngestionCheckpoint,
        now: chrono::DateTime<Utc>,
    ) -> Result<u64, anyhow::Error> {
        let local_path = path.display().to_string();
        let resume_from = checkpoint
            .documents
            .iter()
            .find(|d| d.path == local_path)
            .and_then(|d| d.window_checkpoint)
            .map(|last| last + 1)
            .unwrap_or(1);

        let pages: Vec<u32> = conversion.pages.keys().copied().filter(|&p| p >= resume_from).collect();
        let mut total_chunks = 0u64;

        for window_pages in pages.chunks(CONVERSION_WINDOW_PAGES) {
            let window_conversion = fulltext::ConversionResult {
                pages: window_pages.iter().map(|p| (*p, conversion.pages[p].clone())).collect(),
            };
            let window_cached = if window_pages.first() == Some(&1) { cached_text } else { None };
            let resolved = fulltext::resolve(attachment_key, window_cached, Some(&window_conversion), true, 50)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;

            total_chunks += self
                .embed_and_upsert(item_key, attachment_key, path, citation, &resolved.text, &window_conversion)
                .await?;

            let last_page = *window_pages.last().expect("chunks() never yields an empty slice");
            if let Some(doc) = checkpoint.documents.iter_mut().find(|d| d.path == local_path) {
                doc.mark_window_progress(last_page, now);
            }
            self.checkpoints.save(checkpoint).await?;
        }

        Ok(total_chunks)
    }
}

fn collection_name(project_id: &str) -> String {
    citeloom_storage::vector_index::collection_name(project_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_filter_include_uses_or_semantics() {
        let filter = TagFilter { include_tags: vec!["ml".into(), "nlp".into()], exclude_tags: vec![] };
        assert!(filter.matches(&["Machine Learning".into(), "robotics".into()]));
        assert!(!filter.matches(&["robotics".into()]));
    }

    #[test]
    fn tag_filter_exclude_is_any_match() {
        let filter = TagFilter { include_tags: vec![], exclude_tags: vec!["draft".into()] };
        assert!(!filter.matches(&["Draft Paper".into()]));
        assert!(filter.matches(&["final".into()]));
    }

    #[test]
    fn sanitize_filename_strips_reserved_characters_and_dedupes() {
        let mut seen = std::collections::HashSet::new();
        let a = sanitize_filename("a/b:c.pdf", &mut seen);
        let b = sanitize_filename("a/b:c.pdf", &mut seen);
        assert_eq!(a, "a_b_c.pdf");
        assert_eq!(b, "a_b_c_1.pdf");
    }

    #[test]
    fn sanitize_filename_truncates_long_names() {
        let mut seen = std::collections::HashSet::new();
        let long_name = format!("{}.pdf", "a".repeat(300));
        let sanitized = sanitize_filename(&long_name, &mut seen);
        assert!(sanitized.chars().count() <= MAX_FILENAME_LEN);
    }
}
