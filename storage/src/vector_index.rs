//! Vector Index Gateway (C11): a per-project collection in a remote vector
//! store (named dense/sparse vectors, payload indexes, write-guard, upsert
//! with backoff, dense/hybrid search). Wraps a `reqwest::Client` the way
//! `estuary-flow`'s `gazette::journal::Client` wraps its transport: a thin
//! struct holding a client handle plus whatever routing/caching state the
//! protocol needs. Durability of local collection metadata follows the
//! same mutex-per-key caching shape as `dashmap` elsewhere in this crate.

use crate::atomic::write_atomic;
use citeloom_core::error::{CiteloomError, ErrorCode};
use citeloom_core::model::{CitationMetadata, Chunk};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

const UPSERT_BACKOFF_MS: [u64; 3] = [1_000, 2_000, 4_000];

/// Fixed namespace for deriving point ids from chunk ids (§4.11).
const POINT_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6c, 0x69, 0x74, 0x65, 0x6c, 0x6f, 0x6f, 0x6d, 0x2d, 0x70, 0x6f, 0x69, 0x6e, 0x74, 0x2d, 0x6e,
]);

#[derive(Debug, Error)]
pub enum VectorIndexError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("vector store returned an error: {0}")]
    Store(String),
    #[error("collection '{collection}' is bound to dense model '{expected}', but '{provided}' was supplied")]
    EmbeddingModelMismatch {
        collection: String,
        expected: String,
        provided: String,
    },
    #[error("hybrid search unavailable for '{collection}': {reason}")]
    HybridNotSupported { collection: String, reason: String },
    #[error("dimension mismatch: collection expects {expected}, vector has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl CiteloomError for VectorIndexError {
    fn error_code(&self) -> ErrorCode {
        match self {
            VectorIndexError::Http(_) | VectorIndexError::Store(_) => ErrorCode::Internal,
            VectorIndexError::EmbeddingModelMismatch { .. } => ErrorCode::FailedPrecondition,
            VectorIndexError::HybridNotSupported { .. } => ErrorCode::FailedPrecondition,
            VectorIndexError::DimensionMismatch { .. } => ErrorCode::InvalidArgument,
        }
    }
}

/// Derives the store-facing collection name from a project id (§3):
/// `citeloom/clean-arch` -> `proj-citeloom-clean-arch`.
pub fn collection_name(project_id: &str) -> String {
    format!("proj-{}", project_id.replace('/', "-"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPayload {
    pub project_id: String,
    pub doc_id: String,
    pub citekey: Option<String>,
    pub year: Option<i32>,
    pub tags: BTreeSet<String>,
    #[serde(rename = "zotero.item_key")]
    pub zotero_item_key: Option<String>,
    #[serde(rename = "zotero.attachment_key")]
    pub zotero_attachment_key: Option<String>,
    pub section_path: Vec<String>,
    pub page_start: u32,
    pub page_end: u32,
    pub doi: Option<String>,
    pub authors: Vec<String>,
    pub title: Option<String>,
    pub source_path: String,
    pub heading_chain: Option<String>,
    pub embed_model: String,
    pub version: u32,
    pub chunk_text: String,
    #[serde(default = "default_point_type")]
    pub r#type: String,
}

fn default_point_type() -> String {
    "chunk".to_string()
}

/// Current payload schema version. Bump when `VectorPayload`'s shape changes.
pub const PAYLOAD_SCHEMA_VERSION: u32 = 1;

impl VectorPayload {
    pub fn from_chunk(chunk: &Chunk, source_path: &str, embed_model: &str, citation: Option<&CitationMetadata>) -> Self {
        Self {
            project_id: String::new(),
            doc_id: chunk.doc_id.clone(),
            citekey: citation.and_then(|c| c.citekey.clone()),
            year: citation.and_then(|c| c.year),
            tags: citation.map(|c| c.tags.clone()).unwrap_or_default(),
            zotero_item_key: None,
            zotero_attachment_key: None,
            section_path: chunk.section_path.clone(),
            page_start: chunk.page_span.start,
            page_end: chunk.page_span.end,
            doi: citation.and_then(|c| c.doi.clone()),
            authors: citation.map(|c| c.authors.clone()).unwrap_or_default(),
            title: citation.map(|c| c.title.clone()),
            source_path: source_path.to_string(),
            heading_chain: chunk.section_heading.clone(),
            embed_model: embed_model.to_string(),
            version: PAYLOAD_SCHEMA_VERSION,
            chunk_text: chunk.text.clone(),
            r#type: "chunk".to_string(),
        }
    }
}

pub struct ChunkUpsert {
    pub chunk: Chunk,
    pub dense_vector: Vec<f32>,
    pub sparse_vector: Option<Vec<(u32, f32)>>,
    pub payload: VectorPayload,
}

/// Point id is a UUID derived deterministically from the chunk id, so repeated
/// upserts of the same chunk always resolve to the same point (§4.11).
pub fn point_id_for_chunk(chunk_id: &str) -> Uuid {
    Uuid::new_v5(&POINT_ID_NAMESPACE, chunk_id.as_bytes())
}

/// Persisted as `<bindings_dir>/<collection>.json` so the write-guard (§4.11
/// step 4) survives a process restart instead of resetting to "unbound" and
/// silently accepting a different dense model.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionBinding {
    dense_model_id: String,
    sparse_model_id: Option<String>,
    hybrid_enabled: bool,
    verified: bool,
}

impl CollectionBinding {
    fn unbound() -> Self {
        Self {
            dense_model_id: String::new(),
            sparse_model_id: None,
            hybrid_enabled: false,
            verified: false,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SearchFilters {
    pub tags: Vec<String>,
    pub year: Option<i32>,
    pub zotero_item_key: Option<String>,
    pub zotero_attachment_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: VectorPayload,
}

pub struct VectorIndexGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    bindings: DashMap<String, Arc<Mutex<CollectionBinding>>>,
    bindings_dir: Option<PathBuf>,
}

impl VectorIndexGateway {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            bindings: DashMap::new(),
            bindings_dir: None,
        }
    }

    /// Opts into durable model-binding storage at `<dir>/<collection>.json`.
    /// Without this, bindings live only in memory and a process restart loses
    /// the write-guard (§4.11 step 4).
    pub fn with_bindings_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bindings_dir = Some(dir.into());
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            req = req.header("api-key", key);
        }
        req
    }

    fn binding_path(&self, collection: &str) -> Option<PathBuf> {
        self.bindings_dir.as_ref().map(|dir| dir.join(format!("{collection}.json")))
    }

    /// Returns the in-memory slot for a collection, first checking the
    /// process's own cache, then reloading from durable storage (if
    /// configured) so a freshly-started process picks up a binding recorded
    /// by an earlier run rather than treating the collection as unbound.
    async fn binding_slot(&self, collection: &str) -> Arc<Mutex<CollectionBinding>> {
        if let Some(existing) = self.bindings.get(collection) {
            return existing.clone();
        }

        let loaded = match self.binding_path(collection) {
            Some(path) => tokio::fs::read(&path).await.ok().and_then(|data| serde_json::from_slice(&data).ok()),
            None => None,
        };

        self.bindings
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(loaded.unwrap_or_else(CollectionBinding::unbound))))
            .clone()
    }

    async fn persist_binding(&self, collection: &str, binding: &CollectionBinding) {
        let Some(path) = self.binding_path(collection) else { return };
        match serde_json::to_vec_pretty(binding) {
            Ok(data) => {
                if let Err(e) = write_atomic(&path, &data).await {
                    tracing::warn!(collection, error = %e, "failed to persist vector index model binding");
                }
            }
            Err(e) => tracing::warn!(collection, error = %e, "failed to serialize vector index model binding"),
        }
    }

    /// Creates the collection (named `dense` vector, optional named `sparse`
    /// vector) and the keyword/full-text payload indexes named in §4.11, if
    /// it does not already exist.
    pub async fn ensure_collection(
        &self,
        collection: &str,
        dense_dim: usize,
        hybrid_enabled: bool,
    ) -> Result<(), VectorIndexError> {
        let mut vectors = json!({ "dense": { "size": dense_dim, "distance": "Cosine" } });
        if hybrid_enabled {
            vectors["sparse"] = json!({ "size": 0, "distance": "Dot", "modifier": "idf" });
        }

        let resp = self
            .request(reqwest::Method::PUT, &format!("/collections/{collection}"))
            .json(&json!({ "vectors": vectors }))
            .send()
            .await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::CONFLICT {
            return Err(VectorIndexError::Store(resp.text().await.unwrap_or_default()));
        }

        for field in [
            "project_id",
            "doc_id",
            "citekey",
            "year",
            "tags",
            "zotero.item_key",
            "zotero.attachment_key",
        ] {
            let _ = self
                .request(reqwest::Method::PUT, &format!("/collections/{collection}/index"))
                .json(&json!({ "field_name": field, "field_schema": "keyword" }))
                .send()
                .await?;
        }
        if hybrid_enabled {
            let _ = self
                .request(reqwest::Method::PUT, &format!("/collections/{collection}/index"))
                .json(&json!({ "field_name": "chunk_text", "field_schema": "text" }))
                .send()
                .await?;
        }

        Ok(())
    }

    /// Idempotent model binding: the write-guard of §4.11. Repeated binds with
    /// the same dense model id are no-ops; a differing dense model id fails.
    pub async fn bind_model(
        &self,
        collection: &str,
        dense_model_id: &str,
        sparse_model_id: Option<&str>,
    ) -> Result<(), VectorIndexError> {
        let slot = self.binding_slot(collection).await;
        let mut binding = slot.lock().await;

        if binding.dense_model_id.is_empty() {
            binding.dense_model_id = dense_model_id.to_string();
            binding.sparse_model_id = sparse_model_id.map(str::to_string);
            binding.hybrid_enabled = sparse_model_id.is_some();
            binding.verified = true;
            self.persist_binding(collection, &binding).await;
            return Ok(());
        }

        if binding.dense_model_id != dense_model_id {
            return Err(VectorIndexError::EmbeddingModelMismatch {
                collection: collection.to_string(),
                expected: binding.dense_model_id.clone(),
                provided: dense_model_id.to_string(),
            });
        }

        if let Some(sparse) = sparse_model_id {
            if binding.sparse_model_id.as_deref() != Some(sparse) {
                tracing::warn!(collection, sparse, "sparse model id mismatch; hybrid search may degrade");
            }
        }

        Ok(())
    }

    /// Deletes and recreates the collection, discarding the prior binding.
    /// The only sanctioned way to change a bound model (§4.11).
    pub async fn force_rebuild(&self, collection: &str, dense_dim: usize, hybrid_enabled: bool) -> Result<(), VectorIndexError> {
        let _ = self
            .request(reqwest::Method::DELETE, &format!("/collections/{collection}"))
            .send()
            .await?;
        self.bindings.remove(collection);
        if let Some(path) = self.binding_path(collection) {
            let _ = tokio::fs::remove_file(&path).await;
        }
        self.ensure_collection(collection, dense_dim, hybrid_enabled).await
    }

    /// Upserts chunks under the write-guard, retrying on transient failure
    /// with the backoff schedule of §4.11 (1s, 2s, 4s; three attempts).
    pub async fn upsert(
        &self,
        collection: &str,
        project_id: &str,
        dense_model_id: &str,
        sparse_model_id: Option<&str>,
        mut chunks: Vec<ChunkUpsert>,
    ) -> Result<(), VectorIndexError> {
        self.bind_model(collection, dense_model_id, sparse_model_id).await?;

        for upsert in &mut chunks {
            upsert.payload.project_id = project_id.to_string();
        }

        let points: Vec<_> = chunks
            .iter()
            .map(|c| {
                let mut vector = json!({ "dense": c.dense_vector });
                if let Some(sparse) = &c.sparse_vector {
                    vector["sparse"] = json!({
                        "indices": sparse.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
                        "values": sparse.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
                    });
                }
                json!({
                    "id": point_id_for_chunk(&c.chunk.id).to_string(),
                    "vector": vector,
                    "payload": c.payload,
                })
            })
            .collect();

        let mut last_err = None;
        for (attempt, delay_ms) in UPSERT_BACKOFF_MS.iter().enumerate() {
            let resp = self
                .request(reqwest::Method::PUT, &format!("/collections/{collection}/points"))
                .json(&json!({ "points": points }))
                .send()
                .await;

            match resp {
                Ok(r) if r.status().is_success() => {
                    last_err = None;
                    break;
                }
                Ok(r) => last_err = Some(VectorIndexError::Store(r.text().await.unwrap_or_default())),
                Err(e) => last_err = Some(VectorIndexError::Http(e)),
            }

            if attempt + 1 < UPSERT_BACKOFF_MS.len() {
                tracing::warn!(collection, attempt, "upsert failed, retrying");
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            }
        }

        if let Some(err) = last_err {
            return Err(err);
        }

        let slot = self.binding_slot(collection).await;
        let mut binding = slot.lock().await;
        if binding.dense_model_id != dense_model_id {
            tracing::warn!(collection, "model binding could not be re-asserted after upsert");
            binding.verified = false;
            self.persist_binding(collection, &binding).await;
        }

        Ok(())
    }

    /// Dense search. `project_id` is always enforced server-side as a `must` filter.
    pub async fn search_dense(
        &self,
        collection: &str,
        project_id: &str,
        query_vector: &[f32],
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, VectorIndexError> {
        let filter = build_filter(project_id, filters);
        let resp = self
            .request(reqwest::Method::POST, &format!("/collections/{collection}/points/search"))
            .json(&json!({
                "vector": { "name": "dense", "vector": query_vector },
                "filter": filter,
                "limit": top_k,
                "with_payload": true,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(VectorIndexError::Store(resp.text().await.unwrap_or_default()));
        }

        parse_hits(resp).await
    }

    /// Hybrid search: requires both dense and sparse models bound. Fuses by
    /// reciprocal-rank when the store supports it server-side via `/points/query`;
    /// falls back to a local convex combination (0.3 text, 0.7 dense) otherwise.
    pub async fn search_hybrid(
        &self,
        collection: &str,
        project_id: &str,
        dense_vector: &[f32],
        sparse_vector: &[(u32, f32)],
        filters: &SearchFilters,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, VectorIndexError> {
        let slot = self.binding_slot(collection).await;
        let binding = slot.lock().await;
        if !binding.hybrid_enabled || binding.sparse_model_id.is_none() {
            return Err(VectorIndexError::HybridNotSupported {
                collection: collection.to_string(),
                reason: "collection has no bound sparse model".to_string(),
            });
        }
        drop(binding);

        let filter = build_filter(project_id, filters);
        let resp = self
            .request(reqwest::Method::POST, &format!("/collections/{collection}/points/query"))
            .json(&json!({
                "prefetch": [
                    { "query": dense_vector, "using": "dense", "limit": top_k * 2 },
                    {
                        "query": {
                            "indices": sparse_vector.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
                            "values": sparse_vector.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
                        },
                        "using": "sparse",
                        "limit": top_k * 2,
                    },
                ],
                "query": { "fusion": "rrf" },
                "filter": filter,
                "limit": top_k,
                "with_payload": true,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(VectorIndexError::Store(resp.text().await.unwrap_or_default()));
        }

        parse_hits(resp).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDescription {
    pub size: u64,
    pub payload_keys: Vec<String>,
    pub sample: Vec<SearchHit>,
}

impl VectorIndexGateway {
    /// Collection inspection (A5's `inspect_collection` tool): point count via
    /// the collection info endpoint plus a small payload sample via scroll,
    /// with no vector or filter involved.
    pub async fn describe_collection(&self, collection: &str, sample: usize) -> Result<CollectionDescription, VectorIndexError> {
        let info_resp = self
            .request(reqwest::Method::GET, &format!("/collections/{collection}"))
            .send()
            .await?;
        if !info_resp.status().is_success() {
            return Err(VectorIndexError::Store(info_resp.text().await.unwrap_or_default()));
        }

        #[derive(Deserialize)]
        struct InfoEnvelope {
            result: InfoResult,
        }
        #[derive(Deserialize)]
        struct InfoResult {
            #[serde(default)]
            points_count: u64,
        }
        let info: InfoEnvelope = info_resp.json().await?;

        let mut sample_points = Vec::new();
        let mut payload_keys: BTreeSet<String> = BTreeSet::new();
        if sample > 0 {
            let scroll_resp = self
                .request(reqwest::Method::POST, &format!("/collections/{collection}/points/scroll"))
                .json(&json!({ "limit": sample, "with_payload": true }))
                .send()
                .await?;
            if scroll_resp.status().is_success() {
                #[derive(Deserialize)]
                struct ScrollEnvelope {
                    result: ScrollResult,
                }
                #[derive(Deserialize)]
                struct ScrollResult {
                    points: Vec<ScrollPoint>,
                }
                #[derive(Deserialize)]
                struct ScrollPoint {
                    id: serde_json::Value,
                    payload: VectorPayload,
                }
                let scroll: ScrollEnvelope = scroll_resp.json().await?;
                for point in scroll.result.points {
                    payload_keys.extend(payload_field_names(&point.payload));
                    sample_points.push(SearchHit {
                        id: point.id.to_string(),
                        score: 0.0,
                        payload: point.payload,
                    });
                }
            }
        }

        Ok(CollectionDescription {
            size: info.result.points_count,
            payload_keys: payload_keys.into_iter().collect(),
            sample: sample_points,
        })
    }
}

fn payload_field_names(payload: &VectorPayload) -> Vec<String> {
    serde_json::to_value(payload)
        .ok()
        .and_then(|v| v.as_object().map(|obj| obj.keys().cloned().collect()))
        .unwrap_or_default()
}

fn build_filter(project_id: &str, filters: &SearchFilters) -> serde_json::Value {
    let mut must = vec![json!({ "key": "project_id", "match": { "value": project_id } })];
    for tag in &filters.tags {
        must.push(json!({ "key": "tags", "match": { "value": tag } }));
    }
    if let Some(year) = filters.year {
        must.push(json!({ "key": "year", "match": { "value": year } }));
    }
    if let Some(item_key) = &filters.zotero_item_key {
        must.push(json!({ "key": "zotero.item_key", "match": { "value": item_key } }));
    }
    if let Some(attachment_key) = &filters.zotero_attachment_key {
        must.push(json!({ "key": "zotero.attachment_key", "match": { "value": attachment_key } }));
    }
    json!({ "must": must })
}

async fn parse_hits(resp: reqwest::Response) -> Result<Vec<SearchHit>, VectorIndexError> {
    #[derive(Deserialize)]
    struct Envelope {
        result: Vec<SearchHit>,
    }
    let envelope: Envelope = resp.json().await?;
    Ok(envelope.result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn collection_name_replaces_slashes() {
        assert_eq!(collection_name("citeloom/clean-arch"), "proj-citeloom-clean-arch");
    }

    #[test]
    fn point_id_is_deterministic_per_chunk_id() {
        let a = point_id_for_chunk("abc123");
        let b = point_id_for_chunk("abc123");
        let c = point_id_for_chunk("different");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn bind_model_rejects_mismatched_dense_model() {
        let gateway = VectorIndexGateway::new("http://localhost:6333", None);
        gateway.bind_model("proj-demo", "model-a", None).await.unwrap();
        let result = gateway.bind_model("proj-demo", "model-b", None).await;
        assert!(matches!(result, Err(VectorIndexError::EmbeddingModelMismatch { .. })));
    }

    #[tokio::test]
    async fn bind_model_is_idempotent_for_same_model() {
        let gateway = VectorIndexGateway::new("http://localhost:6333", None);
        gateway.bind_model("proj-demo", "model-a", None).await.unwrap();
        gateway.bind_model("proj-demo", "model-a", None).await.unwrap();
    }

    #[tokio::test]
    async fn model_binding_survives_a_fresh_gateway_instance() {
        let dir = tempdir().unwrap();
        let gateway = VectorIndexGateway::new("http://localhost:6333", None).with_bindings_dir(dir.path());
        gateway.bind_model("proj-demo", "model-a", None).await.unwrap();

        let fresh = VectorIndexGateway::new("http://localhost:6333", None).with_bindings_dir(dir.path());
        let result = fresh.bind_model("proj-demo", "model-b", None).await;
        assert!(matches!(result, Err(VectorIndexError::EmbeddingModelMismatch { .. })));
    }

    #[tokio::test]
    async fn hybrid_search_without_sparse_binding_fails() {
        let gateway = VectorIndexGateway::new("http://localhost:6333", None);
        gateway.bind_model("proj-demo", "model-a", None).await.unwrap();
        let result = gateway
            .search_hybrid("proj-demo", "citeloom/demo", &[0.0], &[], &SearchFilters::default(), 5)
            .await;
        assert!(matches!(result, Err(VectorIndexError::HybridNotSupported { .. })));
    }
}
