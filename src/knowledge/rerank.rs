//! Reranker - 크로스 인코더 2차 점수화
//!
//! 퓨전된 상위 후보를 (쿼리, 본문 앞부분) 쌍으로 다시 점수화합니다.
//! 모델이 없거나 실패하면 입력 순서를 그대로 k개로 잘라 돌려줍니다.
//!
//! `reranker` feature를 켜면 fastembed의 `TextRerank`를 사용합니다.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::fusion::FusionCandidate;

/// 리랭커에 넘길 본문 앞부분 길이 기본값 (문자 수)
pub const DEFAULT_PREFIX_CHARS: usize = 500;

// ============================================================================
// CrossEncoder Trait
// ============================================================================

/// 쿼리-문서 쌍 점수 모델
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    /// 각 passage의 관련도 점수 (입력 순서와 같은 길이)
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;

    /// 모델 이름
    fn name(&self) -> &str;
}

/// 리랭킹 결과
#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub candidates: Vec<FusionCandidate>,
    /// 모델 점수로 재정렬되었는지
    pub reranked: bool,
}

// ============================================================================
// Rerank
// ============================================================================

/// 후보 재정렬 후 상위 k개 반환
pub async fn rerank(
    encoder: Option<&dyn CrossEncoder>,
    query: &str,
    candidates: Vec<FusionCandidate>,
    k: usize,
    prefix_chars: usize,
) -> RerankOutcome {
    let encoder = match encoder {
        Some(e) if !candidates.is_empty() => e,
        _ => return passthrough(candidates, k),
    };

    let passages: Vec<String> = candidates
        .iter()
        .map(|c| c.chunk.content.chars().take(prefix_chars).collect())
        .collect();

    let scores = match encoder.score(query, &passages).await {
        Ok(scores) if scores.len() == candidates.len() => scores,
        Ok(scores) => {
            tracing::warn!(
                "Reranker {} returned {} scores for {} candidates, keeping fused order",
                encoder.name(),
                scores.len(),
                candidates.len()
            );
            return passthrough(candidates, k);
        }
        Err(e) => {
            tracing::warn!("Reranker {} failed, keeping fused order: {}", encoder.name(), e);
            return passthrough(candidates, k);
        }
    };

    let mut scored: Vec<(FusionCandidate, f32)> = candidates.into_iter().zip(scores).collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let candidates = scored
        .into_iter()
        .take(k)
        .map(|(mut c, score)| {
            c.rerank_score = Some(round4(score));
            c
        })
        .collect();

    RerankOutcome {
        candidates,
        reranked: true,
    }
}

fn passthrough(mut candidates: Vec<FusionCandidate>, k: usize) -> RerankOutcome {
    candidates.truncate(k);
    RerankOutcome {
        candidates,
        reranked: false,
    }
}

fn round4(x: f32) -> f32 {
    (x * 10_000.0).round() / 10_000.0
}

// ============================================================================
// fastembed Cross-Encoder
// ============================================================================

/// fastembed TextRerank 기반 크로스 인코더
///
/// ONNX 추론은 블로킹이므로 `spawn_blocking`에서 실행합니다.
#[cfg(feature = "reranker")]
pub struct FastembedReranker {
    model: Arc<std::sync::Mutex<fastembed::TextRerank>>,
}

#[cfg(feature = "reranker")]
impl FastembedReranker {
    /// BGE reranker 모델 로드 (첫 실행 시 다운로드)
    pub fn new() -> Result<Self> {
        use fastembed::{RerankInitOptions, RerankerModel, TextRerank};

        let model = TextRerank::try_new(RerankInitOptions::new(RerankerModel::BGERerankerBase))
            .map_err(|e| anyhow::anyhow!("Failed to load reranker model: {}", e))?;

        Ok(Self {
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "reranker")]
#[async_trait]
impl CrossEncoder for FastembedReranker {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let model = Arc::clone(&self.model);
        let query = query.to_string();
        let passages = passages.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut model = model.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
            let documents: Vec<&str> = passages.iter().map(String::as_str).collect();
            let results = model
                .rerank(query.as_str(), &documents, false, None)
                .map_err(|e| anyhow::anyhow!("Rerank failed: {}", e))?;

            // 결과는 점수순이므로 원래 위치로 되돌림
            let mut scores = vec![f32::MIN; passages.len()];
            for r in results {
                if let Some(slot) = scores.get_mut(r.index) {
                    *slot = r.score;
                }
            }
            Ok(scores)
        })
        .await?
    }

    fn name(&self) -> &str {
        "bge-reranker-base"
    }
}

/// 사용 가능한 기본 크로스 인코더
///
/// `reranker` feature가 꺼져 있거나 모델 로드에 실패하면 None입니다.
pub fn default_cross_encoder() -> Option<Arc<dyn CrossEncoder>> {
    #[cfg(feature = "reranker")]
    {
        match FastembedReranker::new() {
            Ok(model) => return Some(Arc::new(model)),
            Err(e) => tracing::warn!("Reranker unavailable: {}", e),
        }
    }
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::chunker::Chunk;
    use std::sync::Mutex;

    fn candidate(id: usize, content: &str) -> FusionCandidate {
        FusionCandidate {
            chunk: Chunk {
                content: content.to_string(),
                source: "doc.md".to_string(),
                chunk_index: id,
            },
            lexical_score: None,
            vector_score: Some(0.5),
            fused_score: 1.0 / (id as f32 + 1.0),
            rerank_score: None,
        }
    }

    /// "match"가 포함된 passage에 높은 점수를 주는 인코더
    struct KeywordEncoder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CrossEncoder for KeywordEncoder {
        async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>> {
            self.seen.lock().unwrap().extend(passages.iter().cloned());
            Ok(passages
                .iter()
                .map(|p| if p.contains("match") { 0.987654 } else { 0.1 })
                .collect())
        }

        fn name(&self) -> &str {
            "keyword"
        }
    }

    struct FailingEncoder;

    #[async_trait]
    impl CrossEncoder for FailingEncoder {
        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>> {
            anyhow::bail!("model crashed")
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    struct ShortEncoder;

    #[async_trait]
    impl CrossEncoder for ShortEncoder {
        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>> {
            Ok(vec![1.0])
        }

        fn name(&self) -> &str {
            "short"
        }
    }

    fn inputs() -> Vec<FusionCandidate> {
        vec![
            candidate(0, "first"),
            candidate(1, "second"),
            candidate(2, "third has the match"),
        ]
    }

    #[tokio::test]
    async fn test_rerank_reorders_and_attaches_score() {
        let encoder = KeywordEncoder {
            seen: Mutex::new(vec![]),
        };
        let outcome = rerank(Some(&encoder), "q", inputs(), 2, 500).await;

        assert!(outcome.reranked);
        assert_eq!(outcome.candidates.len(), 2);
        assert_eq!(outcome.candidates[0].chunk.chunk_index, 2);
        assert_eq!(outcome.candidates[0].rerank_score, Some(0.9877));
        // 동점은 입력 순서 유지
        assert_eq!(outcome.candidates[1].chunk.chunk_index, 0);
    }

    #[tokio::test]
    async fn test_rerank_truncates_passages() {
        let encoder = KeywordEncoder {
            seen: Mutex::new(vec![]),
        };
        let long = "가".repeat(800);
        rerank(Some(&encoder), "q", vec![candidate(0, &long)], 1, 500).await;

        let seen = encoder.seen.lock().unwrap();
        assert_eq!(seen[0].chars().count(), 500);
    }

    #[tokio::test]
    async fn test_rerank_without_model_passes_through() {
        let outcome = rerank(None, "q", inputs(), 2, 500).await;
        assert!(!outcome.reranked);
        let ids: Vec<usize> = outcome.candidates.iter().map(|c| c.chunk.chunk_index).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_rerank_failure_falls_back() {
        let outcome = rerank(Some(&FailingEncoder), "q", inputs(), 5, 500).await;
        assert!(!outcome.reranked);
        assert_eq!(outcome.candidates.len(), 3);
        assert!(outcome.candidates.iter().all(|c| c.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn test_rerank_length_mismatch_falls_back() {
        let outcome = rerank(Some(&ShortEncoder), "q", inputs(), 3, 500).await;
        assert!(!outcome.reranked);
        assert_eq!(outcome.candidates[0].chunk.chunk_index, 0);
    }

    #[test]
    fn test_round4() {
        assert_eq!(round4(0.123456), 0.1235);
    }
}
