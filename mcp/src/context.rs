//! Shared, process-lifetime state the dispatcher (A5) and CLI functions (A6)
//! both close over: configuration, the vector gateway, and the embedder pool.

use citeloom_core::config::{AppConfig, ProjectConfig};
use citeloom_embedder::EmbedderPool;
use citeloom_query::{RetrievalPolicy, RetrievalUseCase};
use citeloom_storage::vector_index::VectorIndexGateway;
use std::sync::Arc;

pub struct McpContext {
    pub config: AppConfig,
    pub vector_index: Arc<VectorIndexGateway>,
    pub embedder: Arc<EmbedderPool>,
}

impl McpContext {
    pub fn new(config: AppConfig) -> Self {
        let vector_index = Arc::new(
            VectorIndexGateway::new(config.qdrant.url.clone(), config.qdrant.api_key.clone())
                .with_bindings_dir(config.paths.bindings_dir.clone()),
        );
        let embedder = Arc::new(EmbedderPool::new(768));
        Self { config, vector_index, embedder }
    }

    pub fn project(&self, project_id: &str) -> Option<&ProjectConfig> {
        self.config.projects.get(project_id)
    }

    pub fn retrieval_use_case(&self, max_chars_per_chunk: usize) -> RetrievalUseCase {
        RetrievalUseCase {
            vector_index: self.vector_index.clone(),
            embedder: self.embedder.clone(),
            policy: RetrievalPolicy { max_chars_per_chunk, ..RetrievalPolicy::default() },
        }
    }
}
