//! CLI Command Functions (A6): the function each CLI subcommand invokes.
//! Argument parsing itself is out of scope; these take already-parsed, typed
//! argument structs, matching the teacher's split between `clap`-derived
//! structs and a plain `run_*` function per subcommand.

use chrono::Utc;
use citeloom_core::audit::{AuditSink, InMemoryAuditSink};
use citeloom_core::checkpoint::Stage;
use citeloom_core::config::AppConfig;
use citeloom_embedder::EmbedderPool;
use citeloom_ingestion::chunker::ChunkerPipeline;
use citeloom_ingestion::converter::PdfConverter;
use citeloom_ingestion::fulltext::DocumentConverter;
use citeloom_ingestion::orchestrator::{IngestionOrchestrator, OrchestratorError, TagFilter};
use citeloom_query::{RetrievalError, RetrievalRequest, RetrievedChunk};
use citeloom_storage::checkpoint_store::{CheckpointStore, CheckpointStoreError};
use citeloom_storage::manifest_store::{DownloadManifest, ManifestAttachment, ManifestItem, ManifestStore, SourceMarker};
use citeloom_storage::vector_index::{CollectionDescription, SearchFilters, VectorIndexError, VectorIndexGateway};
use citeloom_zotero::types::{ZoteroCollection, ZoteroItem, ZoteroTag};
use citeloom_zotero::{ZoteroError, ZoteroSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    VectorIndex(#[from] VectorIndexError),
    #[error(transparent)]
    Zotero(#[from] ZoteroError),
    #[error(transparent)]
    CheckpointStore(#[from] CheckpointStoreError),
    #[error("project '{0}' is not declared in config")]
    UnknownProject(String),
}

/// What the batch should ingest from: an existing Zotero collection routed
/// through C4, or a plain local file/directory with no Zotero metadata.
pub enum IngestSource {
    ZoteroCollection { key: String, include_subcollections: bool },
    LocalPath(PathBuf),
}

pub struct IngestArgs {
    pub project: String,
    pub source: IngestSource,
    pub correlation_id: Option<String>,
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub correlation_id: String,
    pub documents_processed: u64,
    pub chunks_written: u64,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// `ingest`: acquires (if a Zotero collection was named) and processes a
/// batch, returning the summary the CLI renders as its result table (§6, §7).
pub async fn run_ingest(
    args: IngestArgs,
    config: &AppConfig,
    zotero: Arc<dyn ZoteroSource>,
) -> Result<IngestSummary, CliError> {
    let project = config
        .projects
        .get(&args.project)
        .ok_or_else(|| CliError::UnknownProject(args.project.clone()))?
        .clone();

    let correlation_id = args.correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let downloads_dir = PathBuf::from(&config.paths.downloads_dir);
    let checkpoints_dir = PathBuf::from(&config.paths.checkpoints_dir);

    let orchestrator = IngestionOrchestrator {
        zotero,
        checkpoints: CheckpointStore::new(&checkpoints_dir),
        manifests: ManifestStore::new(&downloads_dir),
        vector_index: Arc::new(
            VectorIndexGateway::new(config.qdrant.url.clone(), config.qdrant.api_key.clone())
                .with_bindings_dir(config.paths.bindings_dir.clone()),
        ),
        embedder: Arc::new(EmbedderPool::new(768)),
        chunker: Arc::new(ChunkerPipeline::default()),
        converter: Arc::new(PdfConverter) as Arc<dyn DocumentConverter>,
        audit: Arc::new(InMemoryAuditSink::default()) as Arc<dyn AuditSink>,
        project_id: args.project.clone(),
        downloads_dir,
        concurrency: args.concurrency.max(1),
        embedding_model_id: project.embedding_model.clone(),
        chunking_policy_version: config.chunking.version.clone(),
        embedding_policy_version: "1.0".to_string(),
    };

    let (mut manifest, collection_key) = match args.source {
        IngestSource::ZoteroCollection { key, include_subcollections } => {
            let tag_filter = TagFilter { include_tags: args.include_tags, exclude_tags: args.exclude_tags };
            let manifest = orchestrator.acquire(&key, include_subcollections, &tag_filter).await?;
            (manifest, Some(key))
        }
        IngestSource::LocalPath(path) => (manifest_from_local_path(&path), None),
    };

    let checkpoint = orchestrator.process(&mut manifest, &correlation_id, collection_key.as_deref()).await?;

    let documents_processed = checkpoint.documents.iter().filter(|d| d.status == Stage::Completed).count() as u64;
    let chunks_written = checkpoint.documents.iter().map(|d| d.chunks_count).sum();
    let errors = checkpoint
        .documents
        .iter()
        .filter(|d| d.status == Stage::Failed)
        .filter_map(|d| d.error.clone())
        .collect();

    Ok(IngestSummary {
        correlation_id,
        documents_processed,
        chunks_written,
        warnings: Vec::new(),
        errors,
    })
}

/// Builds a manifest for a local file or directory of PDFs with no Zotero
/// backing: each file becomes its own item/attachment pair, marked already
/// downloaded from a `Local` source so Phase B can process it unchanged.
fn manifest_from_local_path(path: &Path) -> DownloadManifest {
    let mut manifest = DownloadManifest::new("local".to_string(), "local".to_string(), Utc::now());
    let files: Vec<PathBuf> = if path.is_dir() {
        std::fs::read_dir(path)
            .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).filter(|p| p.is_file()).collect())
            .unwrap_or_default()
    } else {
        vec![path.to_path_buf()]
    };

    for file in files {
        let stem = file.file_stem().and_then(|s| s.to_str()).unwrap_or("document").to_string();
        let filename = file.file_name().and_then(|s| s.to_str()).unwrap_or("document").to_string();
        let file_size = std::fs::metadata(&file).map(|m| m.len()).unwrap_or(0);

        let mut attachment = ManifestAttachment::pending(stem.clone(), filename);
        attachment.mark_success(file.display().to_string(), file_size, SourceMarker::Local);

        let mut item = ManifestItem::new(stem.clone(), stem);
        item.add_attachment(attachment);
        manifest.add_item(item);
    }

    manifest
}

pub struct QueryArgs {
    pub project: String,
    pub query: String,
    pub top_k: usize,
}

/// `query`: runs the retrieval use case (C13) directly, bypassing the tool
/// dispatcher's JSON envelope since the CLI returns typed results.
pub async fn run_query(args: QueryArgs, config: &AppConfig) -> Result<Vec<RetrievedChunk>, CliError> {
    let project = config.projects.get(&args.project).ok_or_else(|| CliError::UnknownProject(args.project.clone()))?;

    let use_case = citeloom_query::RetrievalUseCase {
        vector_index: Arc::new(
            VectorIndexGateway::new(config.qdrant.url.clone(), config.qdrant.api_key.clone())
                .with_bindings_dir(config.paths.bindings_dir.clone()),
        ),
        embedder: Arc::new(EmbedderPool::new(768)),
        policy: citeloom_query::RetrievalPolicy::default(),
    };

    let hits = use_case
        .retrieve(RetrievalRequest {
            project_id: &args.project,
            query_text: &args.query,
            embedding_model_id: &project.embedding_model,
            sparse_model_id: project.sparse_model.as_deref(),
            top_k: args.top_k,
            filters: SearchFilters::default(),
            use_hybrid: false,
        })
        .await?;
    Ok(hits)
}

/// `inspect`: surfaces the same information `inspect_collection` does, for a
/// human reading the terminal rather than an MCP client reading JSON.
pub async fn run_inspect(project_id: &str, config: &AppConfig, sample: usize) -> Result<CollectionDescription, CliError> {
    let project = config.projects.get(project_id).ok_or_else(|| CliError::UnknownProject(project_id.to_string()))?;
    let gateway = VectorIndexGateway::new(config.qdrant.url.clone(), config.qdrant.api_key.clone())
        .with_bindings_dir(config.paths.bindings_dir.clone());
    Ok(gateway.describe_collection(&project.collection, sample.min(5)).await?)
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub config_path: Option<PathBuf>,
    pub project_count: usize,
    pub problems: Vec<String>,
}

/// `validate`: structural config sanity check. Does not reach out to the
/// vector store or Zotero; those would make `validate` itself unreliable in
/// an offline environment.
pub fn run_validate(config: &AppConfig, config_path: Option<PathBuf>) -> ValidationReport {
    let mut problems = Vec::new();
    if config.qdrant.url.is_empty() {
        problems.push("qdrant.url is empty".to_string());
    }
    if config.projects.is_empty() {
        problems.push("no [project.<id>] sections declared".to_string());
    }
    for (id, project) in &config.projects {
        if project.hybrid_enabled && project.sparse_model.is_none() {
            problems.push(format!("project '{id}' has hybrid_enabled=true but no sparse_model"));
        }
    }
    ValidationReport { config_path, project_count: config.projects.len(), problems }
}

/// `zotero list-collections`.
pub async fn zotero_list_collections(zotero: &dyn ZoteroSource) -> Result<Vec<ZoteroCollection>, CliError> {
    Ok(zotero.list_collections().await?)
}

/// `zotero browse-collection`.
pub async fn zotero_browse_collection(
    zotero: &dyn ZoteroSource,
    collection_key: &str,
    include_subcollections: bool,
) -> Result<Vec<ZoteroItem>, CliError> {
    Ok(zotero.get_collection_items(collection_key, include_subcollections).await?)
}

/// `zotero recent-items`.
pub async fn zotero_recent_items(zotero: &dyn ZoteroSource, limit: usize) -> Result<Vec<ZoteroItem>, CliError> {
    Ok(zotero.get_recent_items(limit).await?)
}

/// `zotero list-tags`.
pub async fn zotero_list_tags(zotero: &dyn ZoteroSource) -> Result<Vec<ZoteroTag>, CliError> {
    Ok(zotero.list_tags().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_from_local_path_wraps_a_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paper.pdf");
        std::fs::write(&path, b"%PDF-1.4 stub").unwrap();

        let manifest = manifest_from_local_path(&path);
        assert_eq!(manifest.items.len(), 1);
        let (_, attachment) = &manifest.get_successful_downloads()[0];
        assert_eq!(attachment.filename, "paper.pdf");
    }

    #[test]
    fn validate_flags_hybrid_without_sparse_model() {
        let mut config = sample_config();
        config.projects.insert(
            "demo".to_string(),
            citeloom_core::config::ProjectConfig {
                collection: "proj-demo".to_string(),
                embedding_model: "m1".to_string(),
                sparse_model: None,
                hybrid_enabled: true,
            },
        );
        let report = run_validate(&config, None);
        assert!(report.problems.iter().any(|p| p.contains("hybrid_enabled=true")));
    }

    fn sample_config() -> AppConfig {
        AppConfig {
            chunking: Default::default(),
            qdrant: citeloom_core::config::QdrantConfig { url: "http://localhost:6333".into(), api_key: None },
            paths: citeloom_core::config::PathsConfig {
                raw_documents_dir: "raw".into(),
                audit_dir: "audit".into(),
                checkpoints_dir: "ckpt".into(),
                downloads_dir: "dl".into(),
                bindings_dir: "bindings".into(),
            },
            projects: Default::default(),
            zotero: Default::default(),
            openai_api_key: None,
        }
    }
}
