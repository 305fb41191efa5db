//! Knowledge Graph Builder
//!
//! 청크마다 완성 모델에 엔티티/관계 추출을 요청하고 결과를 병합합니다.
//! 한 청크의 추출 실패는 기록만 하고 건너뜁니다.

use std::collections::{HashMap, HashSet};

use futures::stream::{self, StreamExt};
use serde::Deserialize;

use super::{Entity, GraphState, Relation};
use crate::completion::CompletionProvider;
use crate::config::GraphSettings;
use crate::error::ExtractionError;
use crate::knowledge::chunker::Chunk;

// ============================================================================
// Extraction Prompt & Response
// ============================================================================

const EXTRACTION_PROMPT: &str = r#"아래 텍스트에 등장하는 주요 엔티티(개체)와 그 사이의 관계를 뽑아 주세요.

텍스트:
{text}

응답은 다음 JSON 형식 하나만 출력합니다:
{
  "entities": [
    {"id": "영문_식별자", "name": "엔티티 이름", "type": "PERSON|ORG|TECH|CONCEPT|PRODUCT", "description": "짧은 설명"}
  ],
  "relations": [
    {"source": "출발 엔티티 id", "target": "도착 엔티티 id", "type": "관계 유형", "description": "관계 설명"}
  ]
}

규칙:
- 사람, 조직, 기술, 개념, 제품처럼 의미 있는 엔티티만 포함
- id는 공백 없는 영문
- 관계의 source/target은 entities에 있는 id만 사용
- JSON 이외의 문장은 쓰지 않음"#;

/// 추출된 엔티티 (응답 원형)
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedEntity {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default = "default_entity_type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
}

/// 추출된 관계 (응답 원형)
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedRelation {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(rename = "type", default = "default_relation_type")]
    pub relation_type: String,
    #[serde(default)]
    pub description: String,
}

/// 청크 하나의 추출 결과
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
}

fn default_entity_type() -> String {
    "UNKNOWN".to_string()
}

fn default_relation_type() -> String {
    "RELATED".to_string()
}

/// 추출 응답 파싱
///
/// ``` 로 감싼 응답은 펜스 표시(언어 태그 포함)를 걷어내고 파싱합니다.
/// 펜스가 한 줄 안에서 열리고 닫혀도 됩니다.
pub fn parse_extraction(response: &str) -> Result<Extraction, ExtractionError> {
    let content = response.trim();
    let content = match content.strip_prefix("```") {
        Some(rest) => {
            let body = match rest.split_once('\n') {
                Some((_, body)) => body,
                None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
            };
            body.trim_end().trim_end_matches("```").trim()
        }
        None => content,
    };

    if content.is_empty() {
        return Err(ExtractionError::Empty);
    }
    Ok(serde_json::from_str(content)?)
}

/// 추출 프롬프트 생성 (긴 텍스트는 잘라서 "..." 추가)
fn extraction_prompt(text: &str, max_chars: usize) -> String {
    let text = match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    };
    EXTRACTION_PROMPT.replace("{text}", &text)
}

/// 청크 하나에서 엔티티/관계 추출
pub async fn extract_chunk(
    completer: &dyn CompletionProvider,
    text: &str,
    max_chars: usize,
) -> Result<Extraction, ExtractionError> {
    let prompt = extraction_prompt(text, max_chars);
    let response = completer
        .complete(&prompt)
        .await
        .map_err(|e| ExtractionError::Completion(e.to_string()))?;
    parse_extraction(&response)
}

// ============================================================================
// Merge
// ============================================================================

/// 청크별 추출 결과 누적기
#[derive(Debug, Default)]
pub struct GraphAccumulator {
    entities: Vec<Entity>,
    index: HashMap<String, usize>,
    relations: Vec<Relation>,
    dropped_relations: usize,
}

impl GraphAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 추출 결과 병합
    ///
    /// - 새 id: 추가
    /// - 기존 id: 언급 수 +1, 처음 보는 문서면 sources에 추가
    /// - 같은 청크 안의 중복 id는 한 번만 셈
    /// - 양 끝 엔티티가 없는 관계는 버림
    pub fn merge(&mut self, extraction: Extraction, source: &str) {
        let mut seen_in_chunk = HashSet::new();

        for ent in extraction.entities {
            let id = ent.id.trim().to_string();
            if id.is_empty() || !seen_in_chunk.insert(id.clone()) {
                continue;
            }

            match self.index.get(&id) {
                Some(&i) => {
                    let existing = &mut self.entities[i];
                    existing.mention_count += 1;
                    if !existing.sources.iter().any(|s| s == source) {
                        existing.sources.push(source.to_string());
                    }
                }
                None => {
                    self.index.insert(id.clone(), self.entities.len());
                    self.entities.push(Entity {
                        name: ent.name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| id.clone()),
                        id,
                        entity_type: ent.entity_type,
                        description: ent.description,
                        sources: vec![source.to_string()],
                        mention_count: 1,
                    });
                }
            }
        }

        for rel in extraction.relations {
            if self.index.contains_key(&rel.source) && self.index.contains_key(&rel.target) {
                self.relations.push(Relation {
                    source: rel.source,
                    target: rel.target,
                    relation_type: rel.relation_type,
                    description: rel.description,
                    source_doc: source.to_string(),
                });
            } else {
                self.dropped_relations += 1;
            }
        }
    }

    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.index.get(id).map(|&i| &self.entities[i])
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    pub fn dropped_relations(&self) -> usize {
        self.dropped_relations
    }

    /// 그래프 구성 + 커뮤니티 계산
    pub fn finish(self) -> GraphState {
        GraphState::from_parts(self.entities, self.relations)
    }
}

// ============================================================================
// Build
// ============================================================================

/// 청크 단위 추출 실패
#[derive(Debug)]
pub struct ChunkFailure {
    pub source: String,
    pub chunk_index: usize,
    pub error: ExtractionError,
}

/// 그래프 빌드 결과 집계
#[derive(Debug, Default)]
pub struct GraphBuildReport {
    /// 추출을 요청한 청크 수
    pub chunks_processed: usize,
    /// 너무 짧아 건너뛴 청크 수
    pub chunks_skipped: usize,
    pub failures: Vec<ChunkFailure>,
    pub entities: usize,
    pub relations: usize,
    pub dropped_relations: usize,
    pub communities: usize,
}

/// 청크에서 지식 그래프 구축
///
/// 앞에서부터 `chunk_limit`개 청크만 처리합니다. 요청은 `concurrency`개까지
/// 동시에 보내지만 병합은 청크 순서대로 합니다.
pub async fn build_graph(
    completer: &dyn CompletionProvider,
    chunks: &[Chunk],
    settings: &GraphSettings,
) -> (GraphState, GraphBuildReport) {
    let mut report = GraphBuildReport::default();
    let limited = &chunks[..chunks.len().min(settings.chunk_limit)];

    let eligible: Vec<&Chunk> = limited
        .iter()
        .filter(|c| c.content.chars().count() >= settings.min_chunk_chars)
        .collect();
    report.chunks_skipped = limited.len() - eligible.len();
    report.chunks_processed = eligible.len();

    tracing::info!(
        "Graph build started: {} chunks (limit {})",
        eligible.len(),
        settings.chunk_limit
    );

    let max_chars = settings.max_text_chars;
    let results: Vec<(&Chunk, Result<Extraction, ExtractionError>)> = stream::iter(eligible)
        .map(|chunk| async move { (chunk, extract_chunk(completer, &chunk.content, max_chars).await) })
        .buffered(settings.concurrency.max(1))
        .collect()
        .await;

    let mut acc = GraphAccumulator::new();
    let total = results.len();
    for (i, (chunk, result)) in results.into_iter().enumerate() {
        match result {
            Ok(extraction) => {
                tracing::debug!(
                    "Graph chunk {}/{}: {} entities, {} relations",
                    i + 1,
                    total,
                    extraction.entities.len(),
                    extraction.relations.len()
                );
                acc.merge(extraction, &chunk.source);
            }
            Err(error) => {
                tracing::warn!(
                    "Entity extraction failed for {}#{}: {}",
                    chunk.source,
                    chunk.chunk_index,
                    error
                );
                report.failures.push(ChunkFailure {
                    source: chunk.source.clone(),
                    chunk_index: chunk.chunk_index,
                    error,
                });
            }
        }
    }

    report.dropped_relations = acc.dropped_relations();
    let state = acc.finish();

    report.entities = state.entities().len();
    report.relations = state.relations().len();
    report.communities = state.communities().len();

    if state.is_ready() {
        tracing::info!(
            "Graph build done: {} entities, {} relations, {} communities",
            report.entities,
            report.relations,
            report.communities
        );
    } else {
        tracing::warn!("Graph build produced no entities, graph unavailable");
    }

    (state, report)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn extraction(json: &str) -> Extraction {
        parse_extraction(json).unwrap()
    }

    #[test]
    fn test_parse_plain_json() {
        let e = extraction(r#"{"entities":[{"id":"ltv","name":"LTV"}],"relations":[]}"#);
        assert_eq!(e.entities.len(), 1);
        assert_eq!(e.entities[0].entity_type, "UNKNOWN");
    }

    #[test]
    fn test_parse_fenced_json() {
        let response = "```json\n{\"entities\":[],\"relations\":[{\"source\":\"a\",\"target\":\"b\"}]}\n```";
        let e = extraction(response);
        assert_eq!(e.relations[0].relation_type, "RELATED");
    }

    #[test]
    fn test_parse_single_line_fence() {
        let e = extraction("```json {\"entities\":[{\"id\":\"aov\",\"name\":\"AOV\"}],\"relations\":[]}```");
        assert_eq!(e.entities[0].id, "aov");

        let e = extraction("``` {\"entities\":[],\"relations\":[]} ```");
        assert!(e.entities.is_empty());

        assert!(matches!(parse_extraction("```json\n```"), Err(ExtractionError::Empty)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_extraction("   "), Err(ExtractionError::Empty)));
        assert!(matches!(parse_extraction("not json"), Err(ExtractionError::Malformed(_))));
    }

    #[test]
    fn test_prompt_truncates_text() {
        let prompt = extraction_prompt(&"가".repeat(10), 4);
        assert!(prompt.contains("가가가가..."));
        assert!(!prompt.contains("{text}"));
    }

    #[test]
    fn test_merge_same_id_across_chunks() {
        let mut acc = GraphAccumulator::new();
        let e = || extraction(r#"{"entities":[{"id":"cac","name":"CAC"}]}"#);

        acc.merge(e(), "a.md");
        acc.merge(e(), "b.md");
        acc.merge(e(), "a.md");

        let cac = acc.entity("cac").unwrap();
        assert_eq!(cac.mention_count, 3);
        assert_eq!(cac.sources, vec!["a.md", "b.md"]);
        assert_eq!(acc.entity_count(), 1);
    }

    #[test]
    fn test_merge_duplicate_id_within_chunk_counts_once() {
        let mut acc = GraphAccumulator::new();
        acc.merge(
            extraction(r#"{"entities":[{"id":"x"},{"id":"x","name":"Other"}]}"#),
            "a.md",
        );
        let x = acc.entity("x").unwrap();
        assert_eq!(x.mention_count, 1);
        // name이 없으면 id 사용
        assert_eq!(x.name, "x");
    }

    #[test]
    fn test_merge_drops_orphan_relations() {
        let mut acc = GraphAccumulator::new();
        acc.merge(
            extraction(
                r#"{"entities":[{"id":"a"},{"id":"b"},{"id":""}],
                    "relations":[{"source":"a","target":"b"},{"source":"a","target":"zzz"}]}"#,
            ),
            "doc.md",
        );

        assert_eq!(acc.entity_count(), 2);
        assert_eq!(acc.relation_count(), 1);
        assert_eq!(acc.dropped_relations(), 1);
    }

    /// 청크 내용에 "broken"이 있으면 실패하는 완성 모델
    struct ScriptedCompleter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionProvider for ScriptedCompleter {
        async fn complete(&self, prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if prompt.contains("broken") {
                anyhow::bail!("service unavailable");
            }
            if prompt.contains("garbled") {
                return Ok("I cannot help with that".to_string());
            }
            Ok("```json\n{\"entities\":[{\"id\":\"repeat_rate\",\"name\":\"재구매율\",\"type\":\"CONCEPT\"},{\"id\":\"customer\",\"name\":\"고객\"}],\"relations\":[{\"source\":\"repeat_rate\",\"target\":\"customer\",\"type\":\"MEASURES\"}]}\n```".to_string())
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn chunk(source: &str, index: usize, content: &str) -> Chunk {
        Chunk {
            content: content.to_string(),
            source: source.to_string(),
            chunk_index: index,
        }
    }

    fn settings(chunk_limit: usize) -> GraphSettings {
        GraphSettings {
            chunk_limit,
            max_text_chars: 4000,
            min_chunk_chars: 20,
            concurrency: 2,
        }
    }

    #[tokio::test]
    async fn test_build_graph_isolates_failures() {
        let completer = ScriptedCompleter {
            calls: AtomicUsize::new(0),
        };
        let chunks = vec![
            chunk("a.md", 0, "repeat purchase rate measures customer loyalty"),
            chunk("a.md", 1, "broken chunk that the service rejects entirely"),
            chunk("b.md", 0, "garbled chunk where the model answers in prose"),
            chunk("b.md", 1, "short"),
            chunk("c.md", 0, "repeat purchase rate again, in another document"),
        ];

        let (state, report) = build_graph(&completer, &chunks, &settings(10)).await;

        assert!(state.is_ready());
        assert_eq!(report.chunks_skipped, 1);
        assert_eq!(report.chunks_processed, 4);
        assert_eq!(report.failures.len(), 2);
        assert!(matches!(report.failures[0].error, ExtractionError::Completion(_)));
        assert!(matches!(report.failures[1].error, ExtractionError::Malformed(_)));

        let entity = state.entity("repeat_rate").unwrap();
        assert_eq!(entity.mention_count, 2);
        assert_eq!(entity.sources, vec!["a.md", "c.md"]);
        assert_eq!(state.relations().len(), 2);
        assert_eq!(state.edge_count(), 1);
        assert_eq!(state.communities().len(), 1);
    }

    #[tokio::test]
    async fn test_build_graph_respects_chunk_limit() {
        let completer = ScriptedCompleter {
            calls: AtomicUsize::new(0),
        };
        let chunks: Vec<Chunk> = (0..5)
            .map(|i| chunk("a.md", i, "repeat purchase rate measures customer loyalty"))
            .collect();

        build_graph(&completer, &chunks, &settings(2)).await;
        assert_eq!(completer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_build_graph_all_failed_is_not_ready() {
        let completer = ScriptedCompleter {
            calls: AtomicUsize::new(0),
        };
        let chunks = vec![chunk("a.md", 0, "broken chunk that the service rejects entirely")];

        let (state, report) = build_graph(&completer, &chunks, &settings(10)).await;
        assert!(!state.is_ready());
        assert_eq!(report.entities, 0);
    }
}
