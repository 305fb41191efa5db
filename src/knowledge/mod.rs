//! Knowledge 모듈 - 하이브리드 검색 코어
//!
//! - Chunker: 고정 크기 + 오버랩 텍스트 분할
//! - LanceDB: 벡터 검색 (ANN), 디스크 영속화
//! - SQLite FTS5: 키워드 검색 (메모리, 빌드마다 재구성)
//! - Fusion/Rerank: RRF 통합 후 선택적 크로스 인코더 재정렬
//! - Manager: 인덱스 스냅샷과 빌드 파이프라인
//! - Hybrid: 쿼리 진입점

pub mod chunker;
pub mod fusion;
pub mod glossary;
pub mod hybrid;
pub mod keyword;
pub mod lance;
pub mod manager;
pub mod rerank;
pub mod vector;

// Re-exports
pub use chunker::{chunker_for, Chunk, ChunkConfig, ChunkKey, Chunker};
pub use fusion::{fuse, FusionCandidate, SearchMethod};
pub use glossary::{match_glossary, GlossaryHit};
pub use hybrid::{
    GraphSearchResponse, HybridHit, HybridResponse, HybridRetriever, SearchResponse, SearchResult,
    Status, StatusResponse,
};
pub use keyword::{KeywordHit, KeywordIndex};
pub use lance::LanceVectorIndex;
pub use manager::{BuildReport, IndexManager, IndexSnapshot, IndexStatus, StateFile};
pub use rerank::{default_cross_encoder, CrossEncoder, RerankOutcome};
pub use vector::{distance_to_similarity, VectorEntry, VectorHit, VectorIndex};
