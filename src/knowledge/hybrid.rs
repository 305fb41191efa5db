//! 하이브리드 검색 - 키워드(FTS5) + 벡터(LanceDB) RRF 통합
//!
//! 쿼리 진입점 네 가지를 제공합니다.
//! - `search`: 용어 사전 + 벡터 검색 (기본)
//! - `search_hybrid`: 키워드 + 벡터 퓨전, 선택적 리랭킹/그래프 보강
//! - `graph_search`: 지식 그래프 엔티티 검색
//! - `status`: 인덱스/그래프 상태
//!
//! 진입점은 에러를 반환하지 않습니다. 실패는 `status = FAILED`와 `error`로 응답합니다.
//!
//! ref: https://www.elastic.co/blog/hybrid-search-rrf

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::fusion::{fuse, FusionCandidate, SearchMethod};
use super::glossary::match_glossary;
use super::keyword::KeywordHit;
use super::manager::{IndexManager, IndexSnapshot, IndexStatus, StateFile};
use super::rerank::{rerank, CrossEncoder};
use super::vector::VectorHit;
use crate::graph::retriever::{graph_stats, GraphStats, ScoredEntity};
use crate::graph::{search_graph, GraphSearchResult};

/// 그래프 보강 시 붙이는 엔티티 수
const KG_ENTITY_COUNT: usize = 3;
/// 기본 검색에서 용어 사전 결과의 우선순위 기준값
const GLOSSARY_PRIORITY: f32 = 1000.0;
const GLOSSARY_SOURCE: &str = "glossary";

// ============================================================================
// Response Types
// ============================================================================

/// 응답 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    Failed,
}

/// 기본 검색 결과 한 건
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub source: String,
    /// 벡터 거리 (용어 사전 결과는 0)
    pub score: f32,
    pub content: String,
}

/// 기본 검색 응답
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub status: Status,
    pub query: String,
    pub top_k: usize,
    pub rag_ready: bool,
    pub rag_docs_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub results: Vec<SearchResult>,
}

/// 하이브리드 검색 결과 한 건
#[derive(Debug, Clone, Serialize)]
pub struct HybridHit {
    pub title: String,
    pub source: String,
    pub chunk_index: usize,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bm25_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f32>,
    pub fusion_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

/// 하이브리드 검색 응답
#[derive(Debug, Clone, Serialize)]
pub struct HybridResponse {
    pub status: Status,
    pub query: String,
    pub top_k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_method: Option<SearchMethod>,
    pub reranked: bool,
    pub keyword_available: bool,
    pub reranker_available: bool,
    pub kg_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub results: Vec<HybridHit>,
    pub kg_entities: Vec<ScoredEntity>,
}

/// 그래프 검색 응답
#[derive(Debug, Clone, Serialize)]
pub struct GraphSearchResponse {
    pub status: Status,
    /// 그래프가 준비되어 있는지 (false면 결과가 비어 있음)
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub result: GraphSearchResult,
}

/// 상태 응답
///
/// `ready`는 지식 그래프 준비 여부, `index_ready`는 벡터/키워드 인덱스 준비 여부입니다.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub ready: bool,
    pub index_ready: bool,
    pub index_status: IndexStatus,
    pub files_count: usize,
    pub chunks_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_build: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub entity_count: usize,
    pub relation_count: usize,
    pub community_count: usize,
    pub node_count: usize,
    pub edge_count: usize,
    /// 디스크의 사이드카 상태 (있으면)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted: Option<StateFile>,
}

// ============================================================================
// HybridRetriever
// ============================================================================

/// 검색 진입점
///
/// 인덱스 핸들은 쿼리마다 스냅샷 하나로 가져오고, 이후 락 없이 검색합니다.
pub struct HybridRetriever {
    manager: Arc<IndexManager>,
    reranker: Option<Arc<dyn CrossEncoder>>,
}

impl HybridRetriever {
    /// 리랭커 없이 생성
    pub fn new(manager: Arc<IndexManager>) -> Self {
        Self {
            manager,
            reranker: None,
        }
    }

    pub fn with_reranker(manager: Arc<IndexManager>, reranker: Option<Arc<dyn CrossEncoder>>) -> Self {
        Self { manager, reranker }
    }

    pub fn manager(&self) -> &Arc<IndexManager> {
        &self.manager
    }

    pub fn reranker_available(&self) -> bool {
        self.reranker.is_some()
    }

    // ------------------------------------------------------------------------
    // Basic Search
    // ------------------------------------------------------------------------

    /// 기본 검색 (용어 사전 + 벡터)
    ///
    /// 용어 사전 결과를 먼저 넣고 남은 슬롯을 벡터 결과로 채운 뒤 우선순위로 정렬합니다.
    /// 문서 하나당 결과는 하나입니다.
    pub async fn search(&self, query: &str, top_k: usize, api_key: Option<&str>) -> SearchResponse {
        let config = self.manager.config();
        let q = query.trim().to_string();
        let k = config.clamp_top_k(top_k);

        if q.is_empty() {
            return SearchResponse {
                status: Status::Failed,
                query: q,
                top_k: k,
                rag_ready: self.manager.snapshot().is_ready(),
                rag_docs_count: 0,
                error: Some("Empty query".to_string()),
                results: Vec::new(),
            };
        }

        if api_key.is_some() {
            if let Err(e) = self.manager.ensure_embedder(api_key) {
                tracing::warn!("Failed to set up embedding provider: {:#}", e);
            }
        }

        let glossary = match_glossary(&q, k);
        let snapshot = self.manager.ensure_ready().await;

        let (local, search_error) = if snapshot.is_ready() {
            match self.vector_hits(&snapshot, &q, k).await {
                Ok(hits) => (hits, None),
                Err(e) => {
                    tracing::warn!("Vector search failed: {:#}", e);
                    (Vec::new(), Some(format!("RAG search failed: {:#}", e)))
                }
            }
        } else {
            (Vec::new(), None)
        };

        let max_distance = config.max_distance;
        let snippet_chars = config.snippet_chars;

        let mut merged: Vec<(f32, SearchResult)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for hit in glossary {
            let key = hit.title.trim().to_lowercase();
            if key.is_empty() || !seen.insert(key) {
                continue;
            }
            merged.push((
                GLOSSARY_PRIORITY + hit.score,
                SearchResult {
                    title: hit.title,
                    source: GLOSSARY_SOURCE.to_string(),
                    score: 0.0,
                    content: truncate_chars(&hit.content, snippet_chars),
                },
            ));
        }

        let mut remain = k.saturating_sub(merged.len());
        for hit in local {
            if remain == 0 {
                break;
            }
            if hit.distance > max_distance || hit.chunk.content.is_empty() {
                continue;
            }
            let key = hit.chunk.source.trim().to_lowercase();
            if key.is_empty() || !seen.insert(key) {
                continue;
            }
            merged.push((
                100.0 / (1.0 + hit.distance),
                SearchResult {
                    title: title_for(&hit.chunk.source),
                    source: hit.chunk.source.clone(),
                    score: round_to(hit.distance, 6),
                    content: truncate_chars(&hit.chunk.content, snippet_chars),
                },
            ));
            remain -= 1;
        }

        merged.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let results: Vec<SearchResult> = merged.into_iter().map(|(_, r)| r).collect();

        let (status, error) = if !results.is_empty() {
            (Status::Success, search_error)
        } else if search_error.is_some() {
            (Status::Failed, search_error)
        } else {
            match snapshot.status {
                IndexStatus::Ready | IndexStatus::Empty => (Status::Success, snapshot.last_error.clone()),
                IndexStatus::NotBuilt | IndexStatus::Failed => (
                    Status::Failed,
                    Some(
                        snapshot
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "Index not ready".to_string()),
                    ),
                ),
            }
        };

        SearchResponse {
            status,
            query: q,
            top_k: k,
            rag_ready: snapshot.is_ready(),
            rag_docs_count: snapshot.files_count,
            error,
            results,
        }
    }

    // ------------------------------------------------------------------------
    // Hybrid Search
    // ------------------------------------------------------------------------

    /// 하이브리드 검색
    ///
    /// 키워드/벡터를 각각 `top_k * 2`개씩 가져와 RRF로 합칩니다.
    /// 한쪽만 결과가 있으면 그쪽 점수를 그대로 씁니다.
    pub async fn search_hybrid(
        &self,
        query: &str,
        top_k: usize,
        use_reranking: bool,
        use_kg: bool,
    ) -> HybridResponse {
        let config = self.manager.config();
        let q = query.trim().to_string();
        let k = config.clamp_top_k(top_k);

        let mut response = HybridResponse {
            status: Status::Failed,
            query: q.clone(),
            top_k: k,
            search_method: None,
            reranked: false,
            keyword_available: false,
            reranker_available: self.reranker.is_some(),
            kg_available: false,
            error: None,
            results: Vec::new(),
            kg_entities: Vec::new(),
        };

        if q.is_empty() {
            response.error = Some("Empty query".to_string());
            return response;
        }

        let snapshot = self.manager.ensure_ready().await;
        response.keyword_available = snapshot.keyword.is_some();
        response.kg_available = snapshot.graph.is_ready();

        if !snapshot.is_ready() {
            // 문서가 없는 것은 실패가 아니라 빈 결과
            if snapshot.status == IndexStatus::Empty {
                response.status = Status::Success;
            }
            response.error = Some(
                snapshot
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "Index not ready".to_string()),
            );
            return response;
        }

        let fetch = k * 2;
        let (vector, keyword) = tokio::join!(
            self.vector_hits(&snapshot, &q, fetch),
            keyword_hits(&snapshot, &q, fetch)
        );

        let mut errors = Vec::new();
        let vector = vector.unwrap_or_else(|e| {
            tracing::warn!("Hybrid vector search failed: {:#}", e);
            errors.push(format!("Vector search failed: {:#}", e));
            Vec::new()
        });
        let keyword = keyword.unwrap_or_else(|e| {
            tracing::warn!("Hybrid keyword search failed: {:#}", e);
            errors.push(format!("Keyword search failed: {:#}", e));
            Vec::new()
        });

        tracing::debug!(
            "Hybrid candidates: keyword={} vector={}",
            keyword.len(),
            vector.len()
        );

        let Some((method, candidates)) = fuse(&keyword, &vector, config.fusion.rrf_k) else {
            let (status, error) = empty_result_status(errors);
            response.status = status;
            response.error = error;
            return response;
        };

        let (candidates, reranked) = match &self.reranker {
            Some(encoder) if use_reranking && candidates.len() > 1 => {
                let outcome = rerank(
                    Some(encoder.as_ref()),
                    &q,
                    candidates,
                    k,
                    config.rerank.prefix_chars,
                )
                .await;
                (outcome.candidates, outcome.reranked)
            }
            _ => {
                let mut candidates = candidates;
                candidates.truncate(k);
                (candidates, false)
            }
        };

        if use_kg && snapshot.graph.is_ready() {
            response.kg_entities = search_graph(&snapshot.graph, &q, KG_ENTITY_COUNT, false).matched_entities;
        }

        response.status = Status::Success;
        response.search_method = Some(method);
        response.reranked = reranked;
        response.results = candidates
            .into_iter()
            .map(|c| hybrid_hit(c, config.snippet_chars))
            .collect();
        response
    }

    // ------------------------------------------------------------------------
    // Graph Search
    // ------------------------------------------------------------------------

    /// 지식 그래프 검색
    ///
    /// 그래프가 없으면 실패가 아니라 `available = false`인 빈 결과입니다.
    pub async fn graph_search(&self, query: &str, top_k: usize, include_neighbors: bool) -> GraphSearchResponse {
        let q = query.trim();
        let k = self.manager.config().clamp_top_k(top_k);

        if q.is_empty() {
            return GraphSearchResponse {
                status: Status::Failed,
                available: false,
                error: Some("Empty query".to_string()),
                result: GraphSearchResult::default(),
            };
        }

        let snapshot = self.manager.ensure_ready().await;
        let graph = Arc::clone(&snapshot.graph);

        if !graph.is_ready() {
            return GraphSearchResponse {
                status: Status::Success,
                available: false,
                error: None,
                result: GraphSearchResult {
                    graph_stats: graph_stats(&graph),
                    ..GraphSearchResult::default()
                },
            };
        }

        GraphSearchResponse {
            status: Status::Success,
            available: true,
            error: None,
            result: search_graph(&graph, q, k, include_neighbors),
        }
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    /// 현재 인덱스/그래프 상태 (빌드를 유발하지 않음)
    pub fn status(&self) -> StatusResponse {
        let snapshot = self.manager.snapshot();
        let stats: GraphStats = graph_stats(&snapshot.graph);

        StatusResponse {
            ready: snapshot.graph.is_ready(),
            index_ready: snapshot.is_ready(),
            index_status: snapshot.status,
            files_count: snapshot.files_count,
            chunks_count: snapshot.chunks_count,
            last_build: snapshot.last_build,
            last_error: snapshot.last_error.clone(),
            entity_count: stats.total_entities,
            relation_count: stats.total_relations,
            community_count: stats.total_communities,
            node_count: snapshot.graph.node_count(),
            edge_count: snapshot.graph.edge_count(),
            persisted: StateFile::load(&self.manager.config().state_file()),
        }
    }

    /// 쿼리 임베딩 후 벡터 검색
    async fn vector_hits(&self, snapshot: &IndexSnapshot, query: &str, limit: usize) -> anyhow::Result<Vec<VectorHit>> {
        let vector = snapshot
            .vector
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Vector index not loaded"))?;
        let embedder = self
            .manager
            .embedder()
            .ok_or_else(|| anyhow::anyhow!("Embeddings unavailable: no embedding provider"))?;

        let embedding = embedder.embed_query(query).await?;
        vector.search(&embedding, limit).await
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 키워드 검색 (SQLite 호출은 블로킹 스레드에서)
async fn keyword_hits(snapshot: &IndexSnapshot, query: &str, limit: usize) -> anyhow::Result<Vec<KeywordHit>> {
    let Some(index) = snapshot.keyword.clone() else {
        return Ok(Vec::new());
    };
    let query = query.to_string();
    tokio::task::spawn_blocking(move || index.search(&query, limit)).await?
}

/// 후보가 하나도 없을 때의 상태
///
/// 검색기 에러가 없으면 매칭되는 문서가 없는 것이므로 성공입니다.
fn empty_result_status(errors: Vec<String>) -> (Status, Option<String>) {
    if errors.is_empty() {
        (Status::Success, None)
    } else {
        (Status::Failed, Some(errors.join("; ")))
    }
}

fn hybrid_hit(candidate: FusionCandidate, snippet_chars: usize) -> HybridHit {
    let chunk = candidate.chunk;
    HybridHit {
        title: title_for(&chunk.source),
        content: truncate_chars(&chunk.content, snippet_chars),
        source: chunk.source,
        chunk_index: chunk.chunk_index,
        bm25_score: candidate.lexical_score.map(|s| round_to(s, 4)),
        vector_score: candidate.vector_score.map(|s| round_to(s, 4)),
        fusion_score: round_to(candidate.fused_score, 4),
        rerank_score: candidate.rerank_score,
    }
}

fn title_for(source: &str) -> String {
    if source.is_empty() {
        "doc".to_string()
    } else {
        source.to_string()
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn round_to(x: f32, digits: i32) -> f32 {
    let factor = 10f32.powi(digits);
    (x * factor).round() / factor
}

// ============================================================================
// Tests
// ============================================================================
