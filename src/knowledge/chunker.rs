//! Text Chunking Module
//!
//! 정제된 문서를 고정 크기(문자 단위) 청크로 나누고, 인접 청크 사이에
//! 고정 길이 오버랩을 둡니다. 청크 경계는 가능하면 공백/개행 위치로 맞춥니다.
//!
//! 분할 설정이 유효하지 않으면 문서를 통째로 하나의 청크로 넘깁니다
//! (검색 품질은 떨어지지만 결과는 올바름).

use serde::{Deserialize, Serialize};

use crate::extractor::Document;

// ============================================================================
// Chunk
// ============================================================================

/// 검색 단위 청크 (생성 후 불변)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 청크 텍스트
    pub content: String,
    /// 원본 문서 상대경로
    pub source: String,
    /// 문서 내 청크 순번 (0-based)
    pub chunk_index: usize,
}

impl Chunk {
    /// 청크 식별자 (원본 경로, 순번)
    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            source: self.source.clone(),
            chunk_index: self.chunk_index,
        }
    }
}

/// 청크 식별자
///
/// 퓨전 단계의 중복 제거 키로 사용합니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub source: String,
    pub chunk_index: usize,
}

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// 목표 청크 크기 (문자 수)
    pub size: usize,
    /// 인접 청크 오버랩 (문자 수)
    pub overlap: usize,
}

impl ChunkConfig {
    /// 분할 가능한 설정인지 (size > 0, overlap < size)
    pub fn is_valid(&self) -> bool {
        self.size > 0 && self.overlap < self.size
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 텍스트를 청크 문자열로 분할
    fn split(&self, text: &str) -> Vec<String>;

    /// 청커 이름
    fn name(&self) -> &'static str;

    /// 문서 목록을 청크로 변환 (원본 경로 유지)
    fn chunk_documents(&self, documents: &[Document]) -> Vec<Chunk> {
        documents
            .iter()
            .flat_map(|doc| {
                self.split(&doc.text)
                    .into_iter()
                    .enumerate()
                    .map(|(i, content)| Chunk {
                        content,
                        source: doc.source.clone(),
                        chunk_index: i,
                    })
            })
            .collect()
    }
}

// ============================================================================
// FixedSizeChunker
// ============================================================================

/// 고정 크기 + 오버랩 청커
pub struct FixedSizeChunker {
    config: ChunkConfig,
}

impl FixedSizeChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    /// 윈도 후반부의 마지막 공백 위치를 경계로 선택
    fn boundary(chars: &[char], start: usize, end: usize) -> usize {
        let floor = start + (end - start) / 2;
        (floor..end)
            .rev()
            .find(|&i| chars[i].is_whitespace())
            .map(|i| i + 1)
            .unwrap_or(end)
    }
}

impl Chunker for FixedSizeChunker {
    fn split(&self, text: &str) -> Vec<String> {
        let text = text.trim();
        if text.is_empty() {
            return vec![];
        }

        let chars: Vec<char> = text.chars().collect();
        let size = self.config.size;
        let overlap = self.config.overlap;

        if chars.len() <= size {
            return vec![text.to_string()];
        }

        let mut chunks = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let mut end = (start + size).min(chars.len());
            if end < chars.len() {
                end = Self::boundary(&chars, start, end);
            }

            let chunk: String = chars[start..end].iter().collect();
            let chunk = chunk.trim();
            if !chunk.is_empty() {
                chunks.push(chunk.to_string());
            }

            if end >= chars.len() {
                break;
            }

            // 항상 앞으로 진행
            let next = end.saturating_sub(overlap);
            start = if next > start { next } else { end };
        }

        chunks
    }

    fn name(&self) -> &'static str {
        "FixedSizeChunker"
    }
}

// ============================================================================
// PassthroughChunker
// ============================================================================

/// 분할 없이 문서 전체를 하나의 청크로 넘기는 청커
pub struct PassthroughChunker;

impl Chunker for PassthroughChunker {
    fn split(&self, text: &str) -> Vec<String> {
        let text = text.trim();
        if text.is_empty() {
            vec![]
        } else {
            vec![text.to_string()]
        }
    }

    fn name(&self) -> &'static str {
        "PassthroughChunker"
    }
}

// ============================================================================
// Factory Functions
// ============================================================================

/// 설정에 맞는 청커 생성
///
/// 설정이 유효하지 않으면 `PassthroughChunker`로 대체합니다.
pub fn chunker_for(config: ChunkConfig) -> Box<dyn Chunker> {
    if config.is_valid() {
        Box::new(FixedSizeChunker::new(config))
    } else {
        tracing::warn!(
            "Invalid chunk config (size={}, overlap={}), documents pass through unsplit",
            config.size,
            config.overlap
        );
        Box::new(PassthroughChunker)
    }
}

// ============================================================================
// Tests
// ============================================================================
