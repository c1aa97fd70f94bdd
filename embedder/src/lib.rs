pub mod deterministic;
pub mod pool;

pub use pool::{EmbedderError, EmbedderPool, EmbeddingEngine};
