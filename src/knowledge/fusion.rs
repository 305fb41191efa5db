//! Fusion Engine - Reciprocal Rank Fusion
//!
//! 키워드 순위와 벡터 순위를 하나의 순위로 합칩니다.
//! 각 목록에서 0-based 순위 `rank`의 항목은 `1 / (k_rrf + rank + 1)`을 기여하고,
//! 같은 청크(원본 경로, 순번)의 기여를 합산합니다.
//!
//! 한쪽 목록만 있으면 RRF 대신 그 목록의 원래 점수를 0~1 유사도로 바꿔 씁니다.
//! source: https://plg.uwaterloo.ca/~gvcormac/cormacksigir09-rrf.pdf

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::chunker::{Chunk, ChunkKey};
use super::keyword::KeywordHit;
use super::vector::{distance_to_similarity, VectorHit};

/// RRF 상수 기본값
pub const DEFAULT_RRF_K: f32 = 60.0;

// ============================================================================
// Types
// ============================================================================

/// 결과를 만든 검색 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    Hybrid,
    Vector,
    Bm25,
}

impl SearchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::Vector => "vector",
            Self::Bm25 => "bm25",
        }
    }
}

impl std::fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 퓨전 후보 (쿼리마다 생성, 저장하지 않음)
#[derive(Debug, Clone)]
pub struct FusionCandidate {
    pub chunk: Chunk,
    /// 키워드 점수 (키워드 목록에 없으면 None)
    pub lexical_score: Option<f32>,
    /// 벡터 유사도 (벡터 목록에 없으면 None)
    pub vector_score: Option<f32>,
    /// 최종 점수
    pub fused_score: f32,
    /// 리랭킹 점수 (리랭킹 성공 시)
    pub rerank_score: Option<f32>,
}

impl FusionCandidate {
    fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            lexical_score: None,
            vector_score: None,
            fused_score: 0.0,
            rerank_score: None,
        }
    }

    pub fn key(&self) -> ChunkKey {
        self.chunk.key()
    }
}

// ============================================================================
// Fusion
// ============================================================================

/// RRF 기여도
pub fn rrf_contribution(rank: usize, rrf_k: f32) -> f32 {
    1.0 / (rrf_k + rank as f32 + 1.0)
}

/// BM25 점수 -> 0~1 유사도
pub fn normalize_keyword_score(score: f32) -> f32 {
    let s = score.max(0.0);
    s / (1.0 + s)
}

/// 두 순위 목록을 합침
///
/// 두 목록이 모두 비어 있으면 `None` (검색 실패). 결과 0건과 구분됩니다.
pub fn fuse(
    lexical: &[KeywordHit],
    vector: &[VectorHit],
    rrf_k: f32,
) -> Option<(SearchMethod, Vec<FusionCandidate>)> {
    match (lexical.is_empty(), vector.is_empty()) {
        (true, true) => None,
        (false, true) => Some((SearchMethod::Bm25, keyword_only(lexical))),
        (true, false) => Some((SearchMethod::Vector, vector_only(vector))),
        (false, false) => Some((SearchMethod::Hybrid, reciprocal_rank_fusion(lexical, vector, rrf_k))),
    }
}

fn keyword_only(lexical: &[KeywordHit]) -> Vec<FusionCandidate> {
    let mut seen = HashSet::new();
    lexical
        .iter()
        .filter(|hit| seen.insert(hit.chunk.key()))
        .map(|hit| {
            let mut c = FusionCandidate::new(hit.chunk.clone());
            c.lexical_score = Some(hit.score);
            c.fused_score = normalize_keyword_score(hit.score);
            c
        })
        .collect()
}

fn vector_only(vector: &[VectorHit]) -> Vec<FusionCandidate> {
    let mut seen = HashSet::new();
    vector
        .iter()
        .filter(|hit| seen.insert(hit.chunk.key()))
        .map(|hit| {
            let mut c = FusionCandidate::new(hit.chunk.clone());
            c.vector_score = Some(hit.similarity());
            c.fused_score = hit.similarity();
            c
        })
        .collect()
}

fn reciprocal_rank_fusion(
    lexical: &[KeywordHit],
    vector: &[VectorHit],
    rrf_k: f32,
) -> Vec<FusionCandidate> {
    let mut candidates: Vec<FusionCandidate> = Vec::new();
    let mut positions: HashMap<ChunkKey, usize> = HashMap::new();

    let mut lexical_seen = HashSet::new();
    for (rank, hit) in lexical.iter().enumerate() {
        let key = hit.chunk.key();
        if !lexical_seen.insert(key.clone()) {
            continue;
        }
        let idx = *positions.entry(key).or_insert_with(|| {
            candidates.push(FusionCandidate::new(hit.chunk.clone()));
            candidates.len() - 1
        });
        let c = &mut candidates[idx];
        c.lexical_score = Some(hit.score);
        c.fused_score += rrf_contribution(rank, rrf_k);
    }

    let mut vector_seen = HashSet::new();
    for (rank, hit) in vector.iter().enumerate() {
        let key = hit.chunk.key();
        if !vector_seen.insert(key.clone()) {
            continue;
        }
        let idx = *positions.entry(key).or_insert_with(|| {
            candidates.push(FusionCandidate::new(hit.chunk.clone()));
            candidates.len() - 1
        });
        let c = &mut candidates[idx];
        c.vector_score = Some(distance_to_similarity(hit.distance));
        c.fused_score += rrf_contribution(rank, rrf_k);
    }

    // 안정 정렬: 동점이면 처음 등장한 순서 유지
    candidates.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chunk(id: usize) -> Chunk {
        Chunk {
            content: format!("chunk {}", id),
            source: format!("doc{}.md", id % 3),
            chunk_index: id,
        }
    }

    fn kw(ids: &[usize]) -> Vec<KeywordHit> {
        ids.iter()
            .enumerate()
            .map(|(rank, &id)| KeywordHit {
                chunk: chunk(id),
                score: 10.0 - rank as f32,
            })
            .collect()
    }

    fn vec_hits(ids: &[usize]) -> Vec<VectorHit> {
        ids.iter()
            .enumerate()
            .map(|(rank, &id)| VectorHit {
                chunk: chunk(id),
                distance: 0.1 * (rank as f32 + 1.0),
            })
            .collect()
    }

    fn score_of(candidates: &[FusionCandidate], id: usize) -> f32 {
        candidates
            .iter()
            .find(|c| c.chunk.chunk_index == id)
            .map(|c| c.fused_score)
            .unwrap_or(0.0)
    }

    #[test]
    fn test_both_empty_is_failure() {
        assert!(fuse(&[], &[], DEFAULT_RRF_K).is_none());
    }

    #[test]
    fn test_hybrid_sums_contributions() {
        let (method, fused) = fuse(&kw(&[1, 2]), &vec_hits(&[2, 3]), DEFAULT_RRF_K).unwrap();
        assert_eq!(method, SearchMethod::Hybrid);
        assert_eq!(fused.len(), 3);

        // 양쪽에 모두 있는 2번이 1위
        assert_eq!(fused[0].chunk.chunk_index, 2);
        let expected = rrf_contribution(1, 60.0) + rrf_contribution(0, 60.0);
        assert!((fused[0].fused_score - expected).abs() < 1e-6);
        assert!(fused[0].lexical_score.is_some());
        assert!(fused[0].vector_score.is_some());
    }

    #[test]
    fn test_same_content_different_source_not_merged() {
        let mut a = chunk(1);
        let mut b = chunk(1);
        a.source = "x.md".into();
        b.source = "y.md".into();
        let lexical = vec![KeywordHit { chunk: a, score: 1.0 }];
        let vector = vec![VectorHit { chunk: b, distance: 0.2 }];

        let (_, fused) = fuse(&lexical, &vector, DEFAULT_RRF_K).unwrap();
        assert_eq!(fused.len(), 2);
    }

    #[test]
    fn test_keyword_only_fallback_uses_native_scores() {
        let (method, fused) = fuse(&kw(&[5, 4]), &[], DEFAULT_RRF_K).unwrap();
        assert_eq!(method, SearchMethod::Bm25);
        assert!((fused[0].fused_score - normalize_keyword_score(10.0)).abs() < 1e-6);
        assert!(fused[0].fused_score < 1.0);
    }

    #[test]
    fn test_vector_only_fallback_uses_similarity() {
        let (method, fused) = fuse(&[], &vec_hits(&[7]), DEFAULT_RRF_K).unwrap();
        assert_eq!(method, SearchMethod::Vector);
        assert!((fused[0].fused_score - distance_to_similarity(0.1)).abs() < 1e-6);
    }

    #[test]
    fn test_search_method_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&SearchMethod::Bm25).unwrap(), "\"bm25\"");
        assert_eq!(SearchMethod::Hybrid.to_string(), "hybrid");
    }

    fn unique_ids() -> impl Strategy<Value = Vec<usize>> {
        proptest::collection::hash_set(0usize..40, 1..12)
            .prop_map(|s| s.into_iter().collect::<Vec<_>>())
            .prop_shuffle()
    }

    proptest! {
        #[test]
        fn prop_fused_size_bounded(a in unique_ids(), b in unique_ids()) {
            let (_, fused) = fuse(&kw(&a), &vec_hits(&b), DEFAULT_RRF_K).unwrap();
            prop_assert!(fused.len() <= a.len() + b.len());
            let keys: HashSet<_> = fused.iter().map(|c| c.key()).collect();
            prop_assert_eq!(keys.len(), fused.len());
        }

        #[test]
        fn prop_better_rank_raises_score(
            a in unique_ids(),
            b in unique_ids(),
            pick in any::<prop::sample::Index>(),
        ) {
            prop_assume!(a.len() >= 2);
            let pos = 1 + pick.index(a.len() - 1);
            let id = a[pos];

            let mut improved = a.clone();
            improved.swap(pos, pos - 1);

            let (_, before) = fuse(&kw(&a), &vec_hits(&b), DEFAULT_RRF_K).unwrap();
            let (_, after) = fuse(&kw(&improved), &vec_hits(&b), DEFAULT_RRF_K).unwrap();
            prop_assert!(score_of(&after, id) > score_of(&before, id));
        }

        #[test]
        fn prop_single_list_keeps_order(a in unique_ids()) {
            let (_, fused) = fuse(&[], &vec_hits(&a), DEFAULT_RRF_K).unwrap();
            let order: Vec<usize> = fused.iter().map(|c| c.chunk.chunk_index).collect();
            prop_assert_eq!(&order, &a);

            let (_, fused) = fuse(&kw(&a), &[], DEFAULT_RRF_K).unwrap();
            let order: Vec<usize> = fused.iter().map(|c| c.chunk.chunk_index).collect();
            prop_assert_eq!(&order, &a);
        }
    }
}
