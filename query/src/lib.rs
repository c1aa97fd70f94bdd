pub mod retrieval;

pub use retrieval::{RetrievalError, RetrievalPolicy, RetrievalRequest, RetrievalUseCase, RetrievedChunk};
