pub mod chunker;
pub mod context;
pub mod engine;
pub mod rerank;
pub mod store;

pub use chunker::{Chunker, ChunkerConfig};
pub use context::{build_context, truncate_at_sentence, TRUNCATION_MARKER};
pub use engine::{RagEngine, RagEngineConfig};
pub use rerank::{CohereReranker, KeywordReranker, RerankScore, Reranker, RerankerFactory};
pub use store::{FilterOp, MemoryVectorStore, SearchFilter, VectorHit, VectorRecord, VectorStore};

// 重新导出核心类型
pub use pi_core::{RagChunk, RagQuery, RagResult};
pub use pi_error::{PiError, Result};
