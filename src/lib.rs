//! insight-rag - 비즈니스 분석 문서 하이브리드 RAG 검색 코어
//!
//! LanceDB 벡터 검색 + SQLite FTS5 키워드 검색을 RRF로 결합하고,
//! 청크에서 추출한 지식 그래프로 엔티티/관계 검색을 보강합니다.

pub mod cli;
pub mod collector;
pub mod completion;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod graph;
pub mod knowledge;

// Re-exports
pub use completion::{CompletionProvider, GeminiCompletion};
pub use config::{get_data_dir, RagConfig};
pub use embedding::{get_api_key, has_api_key, EmbeddingProvider, GeminiEmbedding};
pub use error::{EmbedError, ExtractionError, LoadError};
pub use graph::{GraphSearchResult, GraphState};
pub use knowledge::{
    BuildReport, Chunk, CrossEncoder, GraphSearchResponse, HybridResponse, HybridRetriever,
    IndexManager, IndexSnapshot, IndexStatus, SearchMethod, SearchResponse, Status,
    StatusResponse,
};
