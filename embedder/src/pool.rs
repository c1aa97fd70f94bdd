//! Embedder Pool (C10): module-scoped map from model id to a live embedding
//! engine. First call instantiates; every later call for the same key reuses
//! the same engine for the rest of the process's life. Ported in meaning from
//! `slm`'s `ModelRegistry` (`register`/`resolve` over a version map), adapted
//! from named NER model versions to embedding engines keyed by model id and
//! an optional config hash.

use crate::deterministic::deterministic_embedding;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedderError {
    #[error("embedding engine construction failed for model {model_id}: {reason}")]
    ConstructionFailed { model_id: String, reason: String },
}

impl citeloom_core::error::CiteloomError for EmbedderError {
    fn error_code(&self) -> citeloom_core::error::ErrorCode {
        citeloom_core::error::ErrorCode::Internal
    }
}

#[async_trait]
pub trait EmbeddingEngine: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>>;
    fn dims(&self) -> usize;
}

/// Always available: returns a shape-correct zero-ish vector via SHA-256
/// hashing rather than failing, so pipelines stay exercisable without a real
/// model configured (§4.10).
pub struct DeterministicEngine {
    model_id: String,
    dims: usize,
}

impl DeterministicEngine {
    pub fn new(model_id: impl Into<String>, dims: usize) -> Self {
        Self { model_id: model_id.into(), dims }
    }
}

#[async_trait]
impl EmbeddingEngine for DeterministicEngine {
    async fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts
            .iter()
            .map(|text| deterministic_embedding(text, &self.model_id, self.dims))
            .collect()
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

fn pool_key(model_id: &str, config_hash: Option<&str>) -> String {
    format!("embedding_model:{}:{}", model_id, config_hash.unwrap_or("default"))
}

/// Caches one engine per `(model_id, config_hash)` for the life of the process.
/// No time- or LRU-based eviction — equal in lifetime to the process (§4.10).
#[derive(Default)]
pub struct EmbedderPool {
    engines: DashMap<String, Arc<dyn EmbeddingEngine>>,
    default_dims: usize,
}

impl EmbedderPool {
    pub fn new(default_dims: usize) -> Self {
        Self {
            engines: DashMap::new(),
            default_dims: default_dims.max(1),
        }
    }

    fn get_or_init(&self, model_id: &str, config_hash: Option<&str>) -> Arc<dyn EmbeddingEngine> {
        let key = pool_key(model_id, config_hash);
        self.engines
            .entry(key)
            .or_insert_with(|| Arc::new(DeterministicEngine::new(model_id.to_string(), self.default_dims)))
            .clone()
    }

    pub async fn embed(&self, texts: &[String], model_id: &str) -> Result<Vec<Vec<f32>>, EmbedderError> {
        let engine = self.get_or_init(model_id, None);
        Ok(engine.embed_batch(texts).await)
    }

    /// Number of distinct engines instantiated so far; used by tests and
    /// diagnostics to confirm reuse rather than re-instantiation.
    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_model_id_reuses_the_same_engine() {
        let pool = EmbedderPool::new(16);
        pool.embed(&["a".to_string()], "model-a").await.unwrap();
        pool.embed(&["b".to_string()], "model-a").await.unwrap();
        pool.embed(&["c".to_string()], "model-b").await.unwrap();
        assert_eq!(pool.engine_count(), 2);
    }

    #[tokio::test]
    async fn embed_returns_shape_correct_vectors_for_unavailable_model() {
        let pool = EmbedderPool::new(32);
        let out = pool.embed(&["x".to_string(), "y".to_string()], "nonexistent-model").await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 32);
    }
}
