//! Tool Dispatcher (A5): maps a tool name and JSON input onto a component
//! call and a uniform output/error envelope (§6), independent of whatever
//! stdio framing wraps it. The dispatcher matches on tool name up front and
//! returns `UNKNOWN_TOOL` for anything else before entering any per-tool
//! `Result`-propagating logic, so there is no ambiguity about which errors
//! come from inside a handler versus from dispatch itself.

use crate::context::McpContext;
use citeloom_core::model::{Chunk, PageSpan};
use citeloom_query::{RetrievalError, RetrievalRequest};
use citeloom_storage::vector_index::{ChunkUpsert, SearchFilters, VectorIndexError, VectorPayload};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ToolError {
    pub code: &'static str,
    pub message: String,
    pub details: Value,
}

impl ToolError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: Value::Null }
    }

    fn with_details(code: &'static str, message: impl Into<String>, details: Value) -> Self {
        Self { code, message: message.into(), details }
    }

    pub fn envelope(&self) -> Value {
        json!({ "error": { "code": self.code, "message": self.message, "details": self.details } })
    }
}

fn from_vector_index_error(e: VectorIndexError) -> ToolError {
    match e {
        VectorIndexError::EmbeddingModelMismatch { collection, expected, provided } => ToolError::with_details(
            "EMBEDDING_MISMATCH",
            format!("collection '{collection}' rejected embedding model '{provided}'"),
            json!({ "expected": expected, "provided": provided }),
        ),
        VectorIndexError::HybridNotSupported { collection, reason } => {
            ToolError::with_details("HYBRID_NOT_SUPPORTED", reason, json!({ "collection": collection }))
        }
        VectorIndexError::DimensionMismatch { expected, actual } => ToolError::with_details(
            "INVALID_INPUT",
            "embedding dimension mismatch",
            json!({ "expected": expected, "actual": actual }),
        ),
        VectorIndexError::Http(_) | VectorIndexError::Store(_) => ToolError::new("INDEX_UNAVAILABLE", e.to_string()),
    }
}

fn from_retrieval_error(e: RetrievalError) -> ToolError {
    match e {
        RetrievalError::ProjectNotFound(project) => {
            ToolError::with_details("INVALID_PROJECT", format!("project '{project}' is not configured"), json!({ "project": project }))
        }
        RetrievalError::VectorIndex(inner) => from_vector_index_error(inner),
        RetrievalError::Embedder(inner) => ToolError::new("INTERNAL_ERROR", inner.to_string()),
    }
}

/// Dispatches `tool_name` against `input`. The caller (stdio loop, test
/// harness, whatever) is responsible only for JSON framing; this function
/// owns the whole tool-name -> component-call -> envelope contract.
pub async fn dispatch(ctx: &McpContext, tool_name: &str, input: Value) -> Result<Value, ToolError> {
    match tool_name {
        "store_chunks" => tokio::time::timeout(Duration::from_secs(15), store_chunks(ctx, input))
            .await
            .map_err(|_| ToolError::new("TIMEOUT", "store_chunks exceeded its 15s deadline"))?,
        "find_chunks" => tokio::time::timeout(Duration::from_secs(8), find_chunks(ctx, input, false))
            .await
            .map_err(|_| ToolError::new("TIMEOUT", "find_chunks exceeded its 8s deadline"))?,
        "query_hybrid" => tokio::time::timeout(Duration::from_secs(15), find_chunks(ctx, input, true))
            .await
            .map_err(|_| ToolError::new("TIMEOUT", "query_hybrid exceeded its 15s deadline"))?,
        "inspect_collection" => tokio::time::timeout(Duration::from_secs(5), inspect_collection(ctx, input))
            .await
            .map_err(|_| ToolError::new("TIMEOUT", "inspect_collection exceeded its 5s deadline"))?,
        "list_projects" => Ok(list_projects(ctx)),
        _ => Err(ToolError::new("UNKNOWN_TOOL", format!("no such tool: {tool_name}"))),
    }
}

#[derive(Deserialize)]
struct StoreChunksInput {
    project: String,
    items: Vec<StoreChunkItem>,
}

#[derive(Deserialize)]
struct StoreChunkItem {
    id: String,
    text: String,
    embedding: Vec<f32>,
    #[serde(default)]
    metadata: Value,
}

const MIN_BATCH_ITEMS: usize = 100;
const MAX_BATCH_ITEMS: usize = 500;

async fn store_chunks(ctx: &McpContext, input: Value) -> Result<Value, ToolError> {
    let request: StoreChunksInput =
        serde_json::from_value(input).map_err(|e| ToolError::new("INVALID_INPUT", e.to_string()))?;

    let project = ctx
        .project(&request.project)
        .ok_or_else(|| ToolError::with_details("INVALID_PROJECT", format!("project '{}' is not configured", request.project), json!({ "project": request.project })))?
        .clone();

    if !(MIN_BATCH_ITEMS..=MAX_BATCH_ITEMS).contains(&request.items.len()) {
        return Err(ToolError::new(
            "INVALID_INPUT",
            format!("items must number between {MIN_BATCH_ITEMS} and {MAX_BATCH_ITEMS}, got {}", request.items.len()),
        ));
    }

    let mut warnings = Vec::new();
    let mut upserts = Vec::with_capacity(request.items.len());
    for item in request.items {
        let page_span = PageSpan::new(1, 1).expect("1..=1 is always a valid span");
        let chunk = match Chunk::new(item.id.clone(), item.text.clone(), page_span, None, Vec::new(), 0, &project.embedding_model, None, None) {
            Ok(c) => c,
            Err(e) => {
                warnings.push(format!("item '{}' skipped: {e}", item.id));
                continue;
            }
        };

        let mut payload = VectorPayload::from_chunk(&chunk, &item.id, &project.embedding_model, None);
        apply_metadata(&mut payload, &item.metadata);
        upserts.push(ChunkUpsert { chunk, dense_vector: item.embedding, sparse_vector: None, payload });
    }

    let chunks_written = upserts.len() as u64;
    let collection = citeloom_storage::vector_index::collection_name(&request.project);
    ctx.vector_index
        .upsert(&collection, &request.project, &project.embedding_model, project.sparse_model.as_deref(), upserts)
        .await
        .map_err(from_vector_index_error)?;

    Ok(json!({
        "chunks_written": chunks_written,
        "project": request.project,
        "embed_model": project.embedding_model,
        "warnings": warnings,
    }))
}

/// Pulls the handful of citation fields a caller may have attached to a raw
/// chunk item (anything else in `metadata` is ignored by design).
fn apply_metadata(payload: &mut VectorPayload, metadata: &Value) {
    let Some(obj) = metadata.as_object() else { return };
    if let Some(citekey) = obj.get("citekey").and_then(Value::as_str) {
        payload.citekey = Some(citekey.to_string());
    }
    if let Some(year) = obj.get("year").and_then(Value::as_i64) {
        payload.year = Some(year as i32);
    }
    if let Some(doi) = obj.get("doi").and_then(Value::as_str) {
        payload.doi = Some(doi.to_string());
    }
    if let Some(tags) = obj.get("tags").and_then(Value::as_array) {
        payload.tags = tags.iter().filter_map(Value::as_str).map(str::to_string).collect::<BTreeSet<_>>();
    }
}

#[derive(Deserialize)]
struct FindChunksInput {
    project: String,
    query: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default)]
    filters: Option<FilterInput>,
}

fn default_top_k() -> usize {
    6
}

#[derive(Deserialize, Default)]
struct FilterInput {
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    year: Option<i32>,
}

async fn find_chunks(ctx: &McpContext, input: Value, use_hybrid: bool) -> Result<Value, ToolError> {
    let request: FindChunksInput =
        serde_json::from_value(input).map_err(|e| ToolError::new("INVALID_INPUT", e.to_string()))?;

    if !(1..=20).contains(&request.top_k) {
        return Err(ToolError::new("INVALID_INPUT", "top_k must be in [1, 20]"));
    }

    let project = ctx
        .project(&request.project)
        .ok_or_else(|| ToolError::with_details("INVALID_PROJECT", format!("project '{}' is not configured", request.project), json!({ "project": request.project })))?
        .clone();

    if use_hybrid && !project.hybrid_enabled {
        return Err(ToolError::with_details(
            "HYBRID_NOT_SUPPORTED",
            format!("project '{}' has no bound sparse model", request.project),
            json!({ "collection": project.collection }),
        ));
    }

    let filters = request.filters.unwrap_or_default();
    let use_case = ctx.retrieval_use_case(1200);
    let hits = use_case
        .retrieve(RetrievalRequest {
            project_id: &request.project,
            query_text: &request.query,
            embedding_model_id: &project.embedding_model,
            sparse_model_id: project.sparse_model.as_deref(),
            top_k: request.top_k,
            filters: SearchFilters { tags: filters.tags, year: filters.year, zotero_item_key: None, zotero_attachment_key: None },
            use_hybrid,
        })
        .await
        .map_err(from_retrieval_error)?;

    let items: Vec<Value> = hits
        .into_iter()
        .map(|h| {
            json!({
                "text": h.text,
                "score": h.score,
                "citekey": h.citekey,
                "section": h.section,
                "page_span": { "start": h.page_start, "end": h.page_end },
                "section_path": h.section_path,
                "doi": h.doi,
            })
        })
        .collect();

    let count = items.len();
    let mut response = json!({ "items": items, "count": count });
    if use_hybrid {
        response["hybrid_enabled"] = json!(true);
    }
    Ok(response)
}

#[derive(Deserialize)]
struct InspectCollectionInput {
    project: String,
    #[serde(default)]
    sample: usize,
}

async fn inspect_collection(ctx: &McpContext, input: Value) -> Result<Value, ToolError> {
    let request: InspectCollectionInput =
        serde_json::from_value(input).map_err(|e| ToolError::new("INVALID_INPUT", e.to_string()))?;

    if request.sample > 5 {
        return Err(ToolError::new("INVALID_INPUT", "sample must be in [0, 5]"));
    }

    let project = ctx
        .project(&request.project)
        .ok_or_else(|| ToolError::with_details("INVALID_PROJECT", format!("project '{}' is not configured", request.project), json!({ "project": request.project })))?
        .clone();

    let description = ctx
        .vector_index
        .describe_collection(&project.collection, request.sample)
        .await
        .map_err(from_vector_index_error)?;

    Ok(json!({
        "project": request.project,
        "collection": project.collection,
        "size": description.size,
        "embed_model": project.embedding_model,
        "payload_keys": description.payload_keys,
        "indexes": { "keyword": true, "fulltext": project.hybrid_enabled },
        "sample": description.sample.into_iter().map(|h| json!({ "id": h.id, "payload": h.payload })).collect::<Vec<_>>(),
    }))
}

fn list_projects(ctx: &McpContext) -> Value {
    let projects: Vec<Value> = ctx
        .config
        .projects
        .iter()
        .map(|(id, p)| {
            json!({
                "id": id,
                "collection": p.collection,
                "embed_model": p.embedding_model,
                "hybrid_enabled": p.hybrid_enabled,
            })
        })
        .collect();
    json!({ "projects": projects })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_tool_is_rejected_before_any_handler_logic() {
        let config = citeloom_core::config::AppConfig {
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
        };
        let ctx = McpContext::new(config);
        let result = dispatch(&ctx, "not_a_real_tool", json!({})).await;
        assert!(matches!(result, Err(ToolError { code: "UNKNOWN_TOOL", .. })));
    }

    #[tokio::test]
    async fn find_chunks_rejects_unconfigured_project() {
        let config = citeloom_core::config::AppConfig {
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
        };
        let ctx = McpContext::new(config);
        let result = dispatch(&ctx, "find_chunks", json!({ "project": "demo/x", "query": "q" })).await;
        assert!(matches!(result, Err(ToolError { code: "INVALID_PROJECT", .. })));
    }
}
