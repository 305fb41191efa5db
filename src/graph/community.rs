//! Community Detection
//!
//! Louvain 방식(지역 이동 + 집약 반복)으로 모듈러리티를 높이는 분할을 찾습니다.
//! 간선이 없어 모듈러리티를 정의할 수 없으면 연결 요소를 커뮤니티로 씁니다.
//!
//! 노드 처리 순서가 고정되어 있어 같은 그래프는 항상 같은 분할을 얻습니다.
//! 결과 커뮤니티는 첫 멤버의 노드 번호 순으로 정렬됩니다.
//! ref: Blondel et al., "Fast unfolding of communities in large networks" (2008)

use std::collections::HashMap;

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::unionfind::UnionFind;

/// 지역 이동 단계 최대 반복 횟수
const MAX_PASSES: usize = 64;
/// 이동으로 인정할 최소 모듈러리티 이득
const MIN_GAIN: f64 = 1e-12;

/// 그래프를 커뮤니티로 분할 (모든 노드가 정확히 하나의 커뮤니티에 속함)
pub fn detect_communities<N, E>(graph: &UnGraph<N, E>) -> Vec<Vec<NodeIndex>> {
    let groups = match louvain(graph) {
        Some(groups) => groups,
        None => {
            tracing::debug!("Modularity undefined, using connected components");
            connected_components(graph)
        }
    };

    groups
        .into_iter()
        .map(|g| g.into_iter().map(NodeIndex::new).collect())
        .collect()
}

// ============================================================================
// Louvain
// ============================================================================

/// 가중 무향 그래프 (집약 단계용)
struct Level {
    /// 이웃 (자기 루프 제외, 양방향 모두 기록)
    adj: Vec<Vec<(usize, f64)>>,
    /// 자기 루프 가중치
    self_loops: Vec<f64>,
}

impl Level {
    fn from_graph<N, E>(graph: &UnGraph<N, E>) -> Self {
        let n = graph.node_count();
        let mut adj = vec![Vec::new(); n];
        let mut self_loops = vec![0.0; n];

        for edge in graph.raw_edges() {
            let (a, b) = (edge.source().index(), edge.target().index());
            if a == b {
                self_loops[a] += 1.0;
            } else {
                adj[a].push((b, 1.0));
                adj[b].push((a, 1.0));
            }
        }

        Self { adj, self_loops }
    }

    fn len(&self) -> usize {
        self.adj.len()
    }

    /// 노드 차수 (자기 루프는 2회)
    fn degree(&self, i: usize) -> f64 {
        self.adj[i].iter().map(|(_, w)| w).sum::<f64>() + 2.0 * self.self_loops[i]
    }

    /// 지역 이동: 이득이 있는 이웃 커뮤니티로 노드를 옮김
    ///
    /// 반환값은 첫 등장 순서로 번호를 다시 매긴 커뮤니티 배열입니다.
    fn local_moving(&self, m2: f64) -> Vec<usize> {
        let n = self.len();
        let degrees: Vec<f64> = (0..n).map(|i| self.degree(i)).collect();
        let mut community: Vec<usize> = (0..n).collect();
        let mut totals = degrees.clone();

        for _ in 0..MAX_PASSES {
            let mut moved = false;

            for i in 0..n {
                let current = community[i];
                let k_i = degrees[i];

                // 이웃 커뮤니티별 연결 가중치 (등장 순서 유지)
                let mut order: Vec<usize> = Vec::new();
                let mut weights: HashMap<usize, f64> = HashMap::new();
                for &(j, w) in &self.adj[i] {
                    let c = community[j];
                    let entry = weights.entry(c).or_insert_with(|| {
                        order.push(c);
                        0.0
                    });
                    *entry += w;
                }

                totals[current] -= k_i;

                let gain = |c: usize| weights.get(&c).copied().unwrap_or(0.0) - totals[c] * k_i / m2;
                let mut best = current;
                let mut best_gain = gain(current);
                for &c in &order {
                    let g = gain(c);
                    if g > best_gain + MIN_GAIN {
                        best = c;
                        best_gain = g;
                    }
                }

                totals[best] += k_i;
                if best != current {
                    community[i] = best;
                    moved = true;
                }
            }

            if !moved {
                break;
            }
        }

        renumber(&community)
    }

    /// 커뮤니티를 노드로 집약한 다음 단계 그래프
    fn aggregate(&self, community: &[usize], count: usize) -> Self {
        let mut links: Vec<HashMap<usize, f64>> = vec![HashMap::new(); count];
        let mut self_loops = vec![0.0; count];

        for i in 0..self.len() {
            let ci = community[i];
            self_loops[ci] += self.self_loops[i];
            for &(j, w) in &self.adj[i] {
                let cj = community[j];
                if ci == cj {
                    // 내부 간선은 양쪽에서 한 번씩 보임
                    self_loops[ci] += w / 2.0;
                } else {
                    *links[ci].entry(cj).or_insert(0.0) += w;
                }
            }
        }

        let adj = links
            .into_iter()
            .map(|m| {
                let mut v: Vec<(usize, f64)> = m.into_iter().collect();
                v.sort_by_key(|(c, _)| *c);
                v
            })
            .collect();

        Self { adj, self_loops }
    }
}

/// 첫 등장 순서로 커뮤니티 번호 재부여
fn renumber(community: &[usize]) -> Vec<usize> {
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    community
        .iter()
        .map(|&c| {
            let next = mapping.len();
            *mapping.entry(c).or_insert(next)
        })
        .collect()
}

/// Louvain 커뮤니티 탐지
///
/// 간선이 없으면 None.
pub fn louvain<N, E>(graph: &UnGraph<N, E>) -> Option<Vec<Vec<usize>>> {
    let mut level = Level::from_graph(graph);
    let n = level.len();
    let m2: f64 = (0..n).map(|i| level.degree(i)).sum();
    if n == 0 || m2 <= 0.0 {
        return None;
    }

    // 원본 노드 -> 현재 단계 노드
    let mut membership: Vec<usize> = (0..n).collect();

    loop {
        let community = level.local_moving(m2);
        let count = community.iter().copied().max().map_or(0, |c| c + 1);

        for m in membership.iter_mut() {
            *m = community[*m];
        }

        if count == level.len() {
            break;
        }
        level = level.aggregate(&community, count);
    }

    Some(group_by_label(&renumber(&membership)))
}

// ============================================================================
// Connected Components (fallback)
// ============================================================================

/// 연결 요소 분할
pub fn connected_components<N, E>(graph: &UnGraph<N, E>) -> Vec<Vec<usize>> {
    let n = graph.node_count();
    let mut uf = UnionFind::<usize>::new(n);
    for edge in graph.raw_edges() {
        uf.union(edge.source().index(), edge.target().index());
    }

    let roots: Vec<usize> = (0..n).map(|i| uf.find(i)).collect();
    group_by_label(&renumber(&roots))
}

/// 라벨(0부터 연속)별 노드 묶기
fn group_by_label(labels: &[usize]) -> Vec<Vec<usize>> {
    let count = labels.iter().copied().max().map_or(0, |c| c + 1);
    let mut groups = vec![Vec::new(); count];
    for (node, &label) in labels.iter().enumerate() {
        groups[label].push(node);
    }
    groups
}

// ============================================================================
// Tests
// ============================================================================
