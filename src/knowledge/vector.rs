//! Vector Index - 벡터 검색 트레이트 및 유틸리티
//!
//! 거리(distance)는 낮을수록 유사합니다. 퓨전 전에 `distance_to_similarity`로
//! 유사도로 변환해야 합니다.

use anyhow::Result;
use async_trait::async_trait;

use super::chunker::Chunk;

// ============================================================================
// Types
// ============================================================================

/// 벡터 엔트리 (저장용)
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub chunk: Chunk,
    /// 임베딩 벡터
    pub embedding: Vec<f32>,
}

/// 벡터 검색 결과
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk: Chunk,
    /// 쿼리와의 거리 (낮을수록 유사)
    pub distance: f32,
}

impl VectorHit {
    pub fn similarity(&self) -> f32 {
        distance_to_similarity(self.distance)
    }
}

// ============================================================================
// VectorIndex Trait
// ============================================================================

/// 벡터 인덱스 트레이트 (async)
///
/// 빌드가 끝난 인덱스는 읽기 전용으로 공유됩니다.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// 최근접 이웃 검색 (거리 오름차순)
    async fn search(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<VectorHit>>;

    /// 저장된 벡터 개수
    async fn count(&self) -> Result<usize>;
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 거리 -> 유사도 변환 (0.0 ~ 1.0)
pub fn distance_to_similarity(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_to_similarity() {
        assert_eq!(distance_to_similarity(0.0), 1.0);
        assert!((distance_to_similarity(1.0) - 0.5).abs() < 1e-6);
        assert!(distance_to_similarity(0.5) > distance_to_similarity(2.0));
        // 음수 거리는 0으로 취급
        assert_eq!(distance_to_similarity(-3.0), 1.0);
    }
}
