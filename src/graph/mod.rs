//! Knowledge Graph - 엔티티/관계 그래프
//!
//! 청크에서 추출한 엔티티와 관계를 무향 그래프로 관리합니다.
//!
//! ## 구조
//! - `builder`: 완성 모델로 청크별 엔티티/관계 추출 후 병합
//! - `community`: 모듈러리티 기반 커뮤니티 탐지 (실패 시 연결 요소)
//! - `retriever`: 쿼리 어휘 일치 기반 그래프 검색
//!
//! 엔티티는 삽입 순서를 유지하며, 그래프 노드 번호는 엔티티 순번과 같습니다.
//! 커뮤니티는 그래프가 만들어질 때마다 전부 다시 계산합니다.

pub mod builder;
pub mod community;
pub mod retriever;

pub use builder::{build_graph, parse_extraction, Extraction, GraphAccumulator, GraphBuildReport};
pub use community::detect_communities;
pub use retriever::{search_graph, GraphSearchResult};

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use petgraph::graph::{NodeIndex, UnGraph};
use serde::{Deserialize, Serialize};

// ============================================================================
// Types
// ============================================================================

/// 엔티티 (그래프 노드)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub description: String,
    /// 엔티티가 언급된 문서 경로 (중복 없음)
    pub sources: Vec<String>,
    /// 언급된 청크 수
    pub mention_count: u32,
}

/// 관계 (그래프 간선, 중복 제거하지 않음)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relation_type: String,
    pub description: String,
    /// 관계가 추출된 문서 경로
    pub source_doc: String,
}

/// 커뮤니티 (엔티티 분할)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Community {
    pub id: usize,
    pub members: Vec<String>,
}

/// graph.json 저장 형식
#[derive(Debug, Serialize, Deserialize)]
struct GraphFile {
    entities: Vec<Entity>,
    relations: Vec<Relation>,
}

// ============================================================================
// GraphState
// ============================================================================

/// 지식 그래프 상태 (빌드 후 읽기 전용)
#[derive(Debug, Clone, Default)]
pub struct GraphState {
    entities: Vec<Entity>,
    index: HashMap<String, usize>,
    relations: Vec<Relation>,
    communities: Vec<Community>,
    graph: UnGraph<String, ()>,
}

impl GraphState {
    /// 그래프 없음 (not ready)
    pub fn empty() -> Self {
        Self::default()
    }

    /// 엔티티/관계로 그래프를 구성하고 커뮤니티 계산
    ///
    /// 양 끝이 모두 알려진 엔티티가 아닌 관계는 버립니다.
    pub fn from_parts(entities: Vec<Entity>, relations: Vec<Relation>) -> Self {
        let mut graph = UnGraph::new_undirected();
        let mut index = HashMap::with_capacity(entities.len());
        let mut kept_entities = Vec::with_capacity(entities.len());

        for entity in entities {
            if entity.id.is_empty() || index.contains_key(&entity.id) {
                continue;
            }
            let node = graph.add_node(entity.id.clone());
            index.insert(entity.id.clone(), node.index());
            kept_entities.push(entity);
        }

        let mut kept_relations = Vec::with_capacity(relations.len());
        for relation in relations {
            match (index.get(&relation.source), index.get(&relation.target)) {
                (Some(&a), Some(&b)) => {
                    graph.update_edge(NodeIndex::new(a), NodeIndex::new(b), ());
                    kept_relations.push(relation);
                }
                _ => tracing::debug!(
                    "Dropping orphan relation {} -> {}",
                    relation.source,
                    relation.target
                ),
            }
        }

        let communities = detect_communities(&graph)
            .into_iter()
            .enumerate()
            .map(|(id, nodes)| Community {
                id,
                members: nodes
                    .into_iter()
                    .map(|n| kept_entities[n.index()].id.clone())
                    .collect(),
            })
            .collect();

        Self {
            entities: kept_entities,
            index,
            relations: kept_relations,
            communities,
            graph,
        }
    }

    /// 엔티티가 하나라도 있어야 검색 가능
    pub fn is_ready(&self) -> bool {
        !self.entities.is_empty()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.index.get(id).map(|&i| &self.entities[i])
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn communities(&self) -> &[Community] {
        &self.communities
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// 직접 이웃 엔티티 (삽입 순서, 자기 자신 제외)
    pub fn neighbors(&self, id: &str) -> Vec<&Entity> {
        let Some(&i) = self.index.get(id) else {
            return vec![];
        };

        let mut positions: Vec<usize> = self
            .graph
            .neighbors(NodeIndex::new(i))
            .map(|n| n.index())
            .filter(|&n| n != i)
            .collect();
        positions.sort_unstable();
        positions.dedup();

        positions.into_iter().map(|n| &self.entities[n]).collect()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// 엔티티/관계를 JSON으로 저장 (커뮤니티는 저장하지 않음)
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = GraphFile {
            entities: self.entities.clone(),
            relations: self.relations.clone(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    /// 저장된 그래프 복원 (커뮤니티 재계산)
    pub fn load(path: &Path) -> Result<Self> {
        let json =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let file: GraphFile = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse graph file {:?}", path))?;
        Ok(Self::from_parts(file.entities, file.relations))
    }
}

// ============================================================================
// Tests
// ============================================================================
