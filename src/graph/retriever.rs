//! Graph Retriever - 어휘 일치 기반 엔티티 검색
//!
//! 점수 규칙 (쿼리/이름/설명 모두 소문자 비교):
//! - 이름이 쿼리를 포함하거나 쿼리가 이름을 포함: +10
//! - 설명이 쿼리를 포함: +5
//! - 2글자 이상 쿼리 단어마다 이름에 있으면 +3, 설명에 있으면 +1

use std::collections::HashSet;

use serde::Serialize;

use super::{Entity, GraphState, Relation};

/// 이웃 확장 대상이 되는 상위 매칭 수
const NEIGHBOR_SEED_COUNT: usize = 3;
/// 이웃 점수 할인율
const NEIGHBOR_DISCOUNT: f32 = 0.5;
const MAX_COMMUNITY_MEMBERS: usize = 10;
const MAX_RELATIONS: usize = 10;

// ============================================================================
// Types
// ============================================================================

/// 점수가 붙은 엔티티
#[derive(Debug, Clone, Serialize)]
pub struct ScoredEntity {
    #[serde(flatten)]
    pub entity: Entity,
    pub score: f32,
    /// 이웃으로 확장된 경우 출발 엔티티 id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
}

/// 매칭 엔티티와 겹치는 커뮤니티
#[derive(Debug, Clone, Serialize)]
pub struct CommunityMatch {
    pub community_id: usize,
    pub member_count: usize,
    pub matched_count: usize,
    pub members: Vec<String>,
}

/// 그래프 규모
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStats {
    pub total_entities: usize,
    pub total_relations: usize,
    pub total_communities: usize,
}

/// 그래프 검색 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphSearchResult {
    pub matched_entities: Vec<ScoredEntity>,
    pub neighbor_entities: Vec<ScoredEntity>,
    pub related_communities: Vec<CommunityMatch>,
    pub related_relations: Vec<Relation>,
    pub graph_stats: GraphStats,
}

// ============================================================================
// Search
// ============================================================================

/// 엔티티 점수 계산
pub fn score_entity(entity: &Entity, query: &str) -> f32 {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return 0.0;
    }

    let name = entity.name.to_lowercase();
    let description = entity.description.to_lowercase();
    let mut score = 0.0;

    if !name.is_empty() && (name.contains(&query) || query.contains(&name)) {
        score += 10.0;
    }
    if description.contains(&query) {
        score += 5.0;
    }

    for word in query.split_whitespace().filter(|w| w.chars().count() >= 2) {
        if name.contains(word) {
            score += 3.0;
        }
        if description.contains(word) {
            score += 1.0;
        }
    }

    score
}

/// 그래프 검색
///
/// 동점 엔티티는 삽입 순서를 유지합니다.
pub fn search_graph(
    state: &GraphState,
    query: &str,
    top_k: usize,
    include_neighbors: bool,
) -> GraphSearchResult {
    let mut matched: Vec<ScoredEntity> = state
        .entities()
        .iter()
        .filter_map(|entity| {
            let score = score_entity(entity, query);
            (score > 0.0).then(|| ScoredEntity {
                entity: entity.clone(),
                score,
                via: None,
            })
        })
        .collect();

    matched.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    matched.truncate(top_k);

    let matched_ids: HashSet<&str> = matched.iter().map(|m| m.entity.id.as_str()).collect();

    let mut neighbors: Vec<ScoredEntity> = Vec::new();
    if include_neighbors {
        let mut added: HashSet<String> = HashSet::new();
        for seed in matched.iter().take(NEIGHBOR_SEED_COUNT) {
            for neighbor in state.neighbors(&seed.entity.id) {
                if matched_ids.contains(neighbor.id.as_str()) || !added.insert(neighbor.id.clone()) {
                    continue;
                }
                neighbors.push(ScoredEntity {
                    entity: neighbor.clone(),
                    score: seed.score * NEIGHBOR_DISCOUNT,
                    via: Some(seed.entity.id.clone()),
                });
            }
        }
        neighbors.truncate(top_k);
    }

    let related_communities = state
        .communities()
        .iter()
        .filter_map(|community| {
            let overlap = community
                .members
                .iter()
                .filter(|m| matched_ids.contains(m.as_str()))
                .count();
            (overlap > 0).then(|| CommunityMatch {
                community_id: community.id,
                member_count: community.members.len(),
                matched_count: overlap,
                members: community.members.iter().take(MAX_COMMUNITY_MEMBERS).cloned().collect(),
            })
        })
        .collect();

    let related_relations = state
        .relations()
        .iter()
        .filter(|r| matched_ids.contains(r.source.as_str()) || matched_ids.contains(r.target.as_str()))
        .take(MAX_RELATIONS)
        .cloned()
        .collect();

    GraphSearchResult {
        matched_entities: matched,
        neighbor_entities: neighbors,
        related_communities,
        related_relations,
        graph_stats: graph_stats(state),
    }
}

pub fn graph_stats(state: &GraphState) -> GraphStats {
    GraphStats {
        total_entities: state.entities().len(),
        total_relations: state.relations().len(),
        total_communities: state.communities().len(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::{entity, relation};

    fn sample() -> GraphState {
        GraphState::from_parts(
            vec![
                entity("repeat_rate", "재구매율", "두 번 이상 구매한 고객 비율"),
                entity("customer", "고객", "가맹점 이용자"),
                entity("ltv", "LTV", "고객 생애 가치"),
                entity("cac", "CAC", "customer acquisition cost"),
                entity("loyalty", "충성도", "재구매율로 측정"),
            ],
            vec![
                relation("repeat_rate", "customer"),
                relation("ltv", "cac"),
                relation("repeat_rate", "loyalty"),
                relation("ltv", "customer"),
            ],
        )
    }

    #[test]
    fn test_score_entity_weights() {
        let e = entity("x", "재구매율", "고객 재구매율 지표");
        // 이름 포함 +10, 설명 포함 +5, 단어 이름 +3, 단어 설명 +1
        assert_eq!(score_entity(&e, "재구매율"), 19.0);
        // 쿼리가 이름을 포함
        assert_eq!(score_entity(&e, "재구매율 추세"), 10.0 + 3.0 + 1.0);
        assert_eq!(score_entity(&e, "   "), 0.0);
    }

    #[test]
    fn test_single_char_words_ignored() {
        let e = entity("x", "abc", "");
        assert_eq!(score_entity(&e, "zz a"), 0.0);
    }

    #[test]
    fn test_search_matches_and_neighbors() {
        let state = sample();
        let result = search_graph(&state, "재구매율", 5, true);

        assert_eq!(result.matched_entities[0].entity.id, "repeat_rate");
        // "충성도"는 설명에 쿼리가 있어 직접 매칭
        assert!(result.matched_entities.iter().any(|m| m.entity.id == "loyalty"));

        let neighbor_ids: Vec<&str> = result
            .neighbor_entities
            .iter()
            .map(|n| n.entity.id.as_str())
            .collect();
        assert!(neighbor_ids.contains(&"customer"));
        assert!(!neighbor_ids.contains(&"loyalty"));

        let customer = &result.neighbor_entities[0];
        assert_eq!(customer.via.as_deref(), Some("repeat_rate"));
        assert_eq!(customer.score, result.matched_entities[0].score * 0.5);
    }

    #[test]
    fn test_neighbors_deduplicated_and_optional() {
        let state = sample();
        // ltv, cac 모두 매칭 -> customer는 한 번만
        let result = search_graph(&state, "ltv cac", 5, true);
        let customers = result
            .neighbor_entities
            .iter()
            .filter(|n| n.entity.id == "customer")
            .count();
        assert_eq!(customers, 1);

        let result = search_graph(&state, "ltv cac", 5, false);
        assert!(result.neighbor_entities.is_empty());
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let state = GraphState::from_parts(
            vec![entity("b", "metric", ""), entity("a", "metric", "")],
            vec![],
        );
        let result = search_graph(&state, "metric", 5, false);
        let ids: Vec<&str> = result.matched_entities.iter().map(|m| m.entity.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_communities_and_relations() {
        let state = sample();
        let result = search_graph(&state, "재구매율", 5, false);

        assert!(!result.related_communities.is_empty());
        assert!(result.related_communities.iter().all(|c| c.matched_count > 0));
        assert!(result
            .related_relations
            .iter()
            .all(|r| r.source == "repeat_rate" || r.target == "repeat_rate"
                || r.source == "loyalty" || r.target == "loyalty"));
        assert_eq!(result.graph_stats.total_entities, 5);
    }

    #[test]
    fn test_no_match() {
        let result = search_graph(&sample(), "weather", 5, true);
        assert!(result.matched_entities.is_empty());
        assert!(result.related_communities.is_empty());
        assert!(result.related_relations.is_empty());
    }
}
