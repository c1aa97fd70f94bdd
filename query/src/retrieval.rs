//! Retrieval Use Case (C13): embed the query, dispatch to dense or hybrid
//! search, apply the retrieval policy, and shape hits for a caller. Ported in
//! meaning from the teacher's `engine.rs` query dispatch, replacing GraphRAG
//! traversal with the vector-search policy of §4.13.

use citeloom_embedder::EmbedderPool;
use citeloom_storage::vector_index::{SearchFilters, SearchHit, VectorIndexError, VectorIndexGateway};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error(transparent)]
    VectorIndex(#[from] VectorIndexError),
    #[error(transparent)]
    Embedder(#[from] citeloom_embedder::EmbedderError),
}

impl citeloom_core::error::CiteloomError for RetrievalError {
    fn error_code(&self) -> citeloom_core::error::ErrorCode {
        use citeloom_core::error::ErrorCode;
        match self {
            RetrievalError::ProjectNotFound(_) => ErrorCode::NotFound,
            RetrievalError::VectorIndex(e) => e.error_code(),
            RetrievalError::Embedder(e) => e.error_code(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalPolicy {
    pub max_top_k: usize,
    pub min_score: f32,
    pub max_chars_per_chunk: usize,
}

impl Default for RetrievalPolicy {
    fn default() -> Self {
        Self { max_top_k: 50, min_score: 0.0, max_chars_per_chunk: 1200 }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub text: String,
    pub score: f32,
    pub citekey: Option<String>,
    pub section: Option<String>,
    pub page_start: u32,
    pub page_end: u32,
    pub section_path: Vec<String>,
    pub doi: Option<String>,
    pub url: Option<String>,
}

pub struct RetrievalRequest<'a> {
    pub project_id: &'a str,
    pub query_text: &'a str,
    pub embedding_model_id: &'a str,
    pub sparse_model_id: Option<&'a str>,
    pub top_k: usize,
    pub filters: SearchFilters,
    pub use_hybrid: bool,
}

pub struct RetrievalUseCase {
    pub vector_index: Arc<VectorIndexGateway>,
    pub embedder: Arc<EmbedderPool>,
    pub policy: RetrievalPolicy,
}

impl RetrievalUseCase {
    pub async fn retrieve(&self, request: RetrievalRequest<'_>) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        if request.project_id.is_empty() {
            return Err(RetrievalError::ProjectNotFound(request.project_id.to_string()));
        }

        let top_k = request.top_k.min(self.policy.max_top_k).max(1);
        let vectors = self.embedder.embed(&[request.query_text.to_string()], request.embedding_model_id).await?;
        let dense_vector = vectors.into_iter().next().unwrap_or_default();

        let collection = citeloom_storage::vector_index::collection_name(request.project_id);
        let hits = if request.use_hybrid {
            let sparse_vector: Vec<(u32, f32)> = Vec::new();
            self.vector_index
                .search_hybrid(&collection, request.project_id, &dense_vector, &sparse_vector, &request.filters, top_k)
                .await?
        } else {
            self.vector_index
                .search_dense(&collection, request.project_id, &dense_vector, &request.filters, top_k)
                .await?
        };

        Ok(hits
            .into_iter()
            .filter(|hit| hit.score >= self.policy.min_score)
            .map(|hit| self.shape_hit(hit))
            .collect())
    }

    fn shape_hit(&self, hit: SearchHit) -> RetrievedChunk {
        RetrievedChunk {
            text: trim_to_word_boundary(&hit.payload.chunk_text, self.policy.max_chars_per_chunk),
            score: hit.score,
            citekey: hit.payload.citekey,
            section: hit.payload.heading_chain,
            page_start: hit.payload.page_start,
            page_end: hit.payload.page_end,
            section_path: hit.payload.section_path,
            doi: hit.payload.doi,
            url: None,
        }
    }
}

/// Trims `text` to at most `max_chars` at the nearest preceding word
/// boundary, appending an ellipsis when truncated (§4.13).
fn trim_to_word_boundary(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    let boundary = truncated.rfind(char::is_whitespace).unwrap_or(truncated.len());
    format!("{}...", &truncated[..boundary])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_to_word_boundary_does_not_cut_mid_word() {
        let text = "the quick brown fox jumps over the lazy dog";
        let trimmed = trim_to_word_boundary(text, 12);
        assert!(trimmed.ends_with("..."));
        assert!(!trimmed.trim_end_matches("...").ends_with(|c: char| c.is_alphanumeric()) || trimmed.trim_end_matches("...").split_whitespace().all(|w| text.contains(w)));
    }

    #[test]
    fn trim_to_word_boundary_is_noop_under_limit() {
        assert_eq!(trim_to_word_boundary("short text", 100), "short text");
    }

    #[tokio::test]
    async fn retrieve_rejects_empty_project_id() {
        let use_case = RetrievalUseCase {
            vector_index: Arc::new(VectorIndexGateway::new("http://localhost:6333", None)),
            embedder: Arc::new(EmbedderPool::new(8)),
            policy: RetrievalPolicy::default(),
        };
        let result = use_case
            .retrieve(RetrievalRequest {
                project_id: "",
                query_text: "test",
                embedding_model_id: "m1",
                sparse_model_id: None,
                top_k: 5,
                filters: SearchFilters::default(),
                use_hybrid: false,
            })
            .await;
        assert!(matches!(result, Err(RetrievalError::ProjectNotFound(_))));
    }
}
