//! CLI 모듈
//!
//! insight-rag CLI 명령어 정의 및 구현

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::config::RagConfig;
use crate::embedding::has_api_key;
use crate::knowledge::{
    default_cross_encoder, BuildReport, GraphSearchResponse, HybridResponse, HybridRetriever,
    IndexManager, IndexSnapshot, SearchResponse, Status, StatusResponse,
};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "insight-rag")]
#[command(version, about = "비즈니스 분석 문서 하이브리드 RAG 검색", long_about = None)]
pub struct Cli {
    /// 설정 파일 경로 (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// 문서 디렉토리 (설정 파일 값보다 우선)
    #[arg(long, global = true)]
    pub docs: Option<PathBuf>,

    /// JSON으로 출력
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 인덱스 빌드 (지문이 같으면 디스크 인덱스 재사용)
    Build {
        /// 캐시를 무시하고 재빌드
        #[arg(long)]
        force: bool,
    },

    /// 기본 검색 (용어 사전 + 벡터)
    Query {
        /// 검색 쿼리
        query: String,

        /// 결과 개수
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },

    /// 하이브리드 검색 (키워드 + 벡터 RRF)
    Hybrid {
        query: String,

        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// 리랭킹 끄기
        #[arg(long)]
        no_rerank: bool,

        /// 지식 그래프 엔티티 포함
        #[arg(long)]
        kg: bool,
    },

    /// 지식 그래프 검색
    Graph {
        query: String,

        #[arg(short = 'k', long, default_value = "5")]
        top_k: usize,

        /// 이웃 엔티티 확장 끄기
        #[arg(long)]
        no_neighbors: bool,
    },

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let mut config =
        RagConfig::load_or_default(cli.config.as_deref()).context("설정 로드 실패")?;
    if let Some(docs) = cli.docs {
        config.docs_dir = docs;
    }

    let default_top_k = config.default_top_k;
    let manager = Arc::new(IndexManager::from_env(config));
    let json = cli.json;

    match cli.command {
        Commands::Build { force } => cmd_build(&manager, force, json).await,
        Commands::Query { query, top_k } => {
            let retriever = HybridRetriever::new(Arc::clone(&manager));
            let response = retriever
                .search(&query, top_k.unwrap_or(default_top_k), None)
                .await;
            emit(&response, json, print_search)
        }
        Commands::Hybrid {
            query,
            top_k,
            no_rerank,
            kg,
        } => {
            let reranker = if no_rerank { None } else { default_cross_encoder() };
            let retriever = HybridRetriever::with_reranker(Arc::clone(&manager), reranker);
            let response = retriever
                .search_hybrid(&query, top_k.unwrap_or(default_top_k), !no_rerank, kg)
                .await;
            emit(&response, json, print_hybrid)
        }
        Commands::Graph {
            query,
            top_k,
            no_neighbors,
        } => {
            let retriever = HybridRetriever::new(Arc::clone(&manager));
            let response = retriever.graph_search(&query, top_k, !no_neighbors).await;
            emit(&response, json, print_graph)
        }
        Commands::Status => {
            let retriever = HybridRetriever::new(Arc::clone(&manager));
            emit(&retriever.status(), json, print_status)
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

#[derive(Serialize)]
struct BuildOutput {
    ready: bool,
    status: crate::knowledge::IndexStatus,
    fingerprint: Option<String>,
    files_count: usize,
    chunks_count: usize,
    error: Option<String>,
    reused_cache: bool,
    documents_rejected: usize,
    load_failures: usize,
    embed_failures: usize,
    graph_entities: usize,
    graph_failures: usize,
}

impl BuildOutput {
    fn new(snapshot: &IndexSnapshot, report: Option<&BuildReport>) -> Self {
        let graph = report.and_then(|r| r.graph.as_ref());
        Self {
            ready: snapshot.is_ready(),
            status: snapshot.status,
            fingerprint: snapshot.fingerprint.clone(),
            files_count: snapshot.files_count,
            chunks_count: snapshot.chunks_count,
            error: snapshot.last_error.clone(),
            reused_cache: report.map(|r| r.reused_cache).unwrap_or(false),
            documents_rejected: report.map(|r| r.documents_rejected).unwrap_or(0),
            load_failures: report.map(|r| r.load_failures.len()).unwrap_or(0),
            embed_failures: report.map(|r| r.embed_failures.len()).unwrap_or(0),
            graph_entities: snapshot.graph.entities().len(),
            graph_failures: graph.map(|g| g.failures.len()).unwrap_or(0),
        }
    }
}

/// 빌드 명령어 (build)
async fn cmd_build(manager: &IndexManager, force: bool, json: bool) -> Result<()> {
    if !has_api_key() && !json {
        println!("[!] API 키가 설정되지 않았습니다.");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    let snapshot = manager.build_or_load(force).await;
    let report = manager.last_report();
    let output = BuildOutput::new(&snapshot, report.as_deref());

    emit(&output, json, |o| {
        if o.ready {
            println!("[OK] 인덱스 준비 완료");
        } else {
            println!("[!] 인덱스 준비 안 됨 ({:?})", o.status);
        }
        println!("     문서 디렉토리: {}", manager.config().docs_dir.display());
        println!("     파일: {}, 청크: {}", o.files_count, o.chunks_count);
        if o.reused_cache {
            println!("     디스크 인덱스 재사용 (임베딩 호출 없음)");
        }
        if o.documents_rejected + o.load_failures + o.embed_failures > 0 {
            println!(
                "     제외 문서: {}, 로드 실패: {}, 임베딩 실패: {}",
                o.documents_rejected, o.load_failures, o.embed_failures
            );
        }
        println!(
            "     그래프 엔티티: {} (추출 실패 {})",
            o.graph_entities, o.graph_failures
        );
        if let Some(ref err) = o.error {
            println!("     오류: {}", err);
        }
    })
}

// ============================================================================
// Output
// ============================================================================

/// JSON 또는 사람이 읽는 형식으로 출력
fn emit<T: Serialize>(value: &T, json: bool, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(value).context("JSON 직렬화 실패")?;
        println!("{}", out);
    } else {
        human(value);
    }
    Ok(())
}

fn print_status_line(status: Status, error: Option<&str>) {
    match status {
        Status::Success => println!("[OK] SUCCESS"),
        Status::Failed => println!("[!] FAILED: {}", error.unwrap_or("-")),
    }
}

fn print_search(r: &SearchResponse) {
    print_status_line(r.status, r.error.as_deref());
    println!("[*] \"{}\" (top_k={}, ready={})", r.query, r.top_k, r.rag_ready);

    if r.results.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return;
    }

    println!();
    for (i, result) in r.results.iter().enumerate() {
        println!("{}. [{}] 거리: {:.4}", i + 1, result.title, result.score);
        println!("   출처: {}", result.source);
        println!("   내용: {}", truncate_text(&result.content, 200));
        println!();
    }
}

fn print_hybrid(r: &HybridResponse) {
    print_status_line(r.status, r.error.as_deref());
    let method = r.search_method.map(|m| m.as_str()).unwrap_or("-");
    println!(
        "[*] \"{}\" (method={}, reranked={}, top_k={})",
        r.query, method, r.reranked, r.top_k
    );

    println!();
    for (i, hit) in r.results.iter().enumerate() {
        print!("{}. [{:.4}] {}#{}", i + 1, hit.fusion_score, hit.source, hit.chunk_index);
        if let Some(score) = hit.rerank_score {
            print!(" (rerank {:.4})", score);
        }
        println!();
        println!("   {}", truncate_text(&hit.content, 200));
        println!();
    }

    if !r.kg_entities.is_empty() {
        println!("[*] 관련 엔티티:");
        for e in &r.kg_entities {
            println!("   - {} [{}] {:.1}", e.entity.name, e.entity.entity_type, e.score);
        }
    }
}

fn print_graph(r: &GraphSearchResponse) {
    print_status_line(r.status, r.error.as_deref());
    if !r.available {
        println!("[!] 지식 그래프가 없습니다.");
        return;
    }

    let result = &r.result;
    println!("[*] 매칭 엔티티 {} 건", result.matched_entities.len());
    for e in &result.matched_entities {
        println!("   - {} ({}) {:.1}: {}", e.entity.name, e.entity.id, e.score, truncate_text(&e.entity.description, 80));
    }

    if !result.neighbor_entities.is_empty() {
        println!("[*] 이웃 엔티티");
        for e in &result.neighbor_entities {
            println!(
                "   - {} ({}) {:.1} via {}",
                e.entity.name,
                e.entity.id,
                e.score,
                e.via.as_deref().unwrap_or("-")
            );
        }
    }

    for c in &result.related_communities {
        println!(
            "[*] 커뮤니티 #{}: {}/{} 매칭, {}",
            c.community_id,
            c.matched_count,
            c.member_count,
            c.members.join(", ")
        );
    }

    for rel in &result.related_relations {
        println!("   {} -[{}]-> {}", rel.source, rel.relation_type, rel.target);
    }

    let stats = &result.graph_stats;
    println!(
        "\n     엔티티 {}, 관계 {}, 커뮤니티 {}",
        stats.total_entities, stats.total_relations, stats.total_communities
    );
}

fn print_status(s: &StatusResponse) {
    println!("insight-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    match &s.persisted {
        Some(state) => {
            println!(
                "[OK] 저장된 인덱스: 파일 {}, 청크 {}, 모델 {} ({}차원)",
                state.files_count, state.chunks_count, state.embed_model, state.dimension
            );
            if let Some(ts) = state.last_build {
                println!("     마지막 빌드: {}", ts.format("%Y-%m-%d %H:%M"));
            }
            println!("     그래프: {}", if state.graph_ready { "있음" } else { "없음" });
            if let Some(ref err) = state.error {
                println!("     오류: {}", err);
            }
        }
        None => println!("[!] 저장된 인덱스 없음 (insight-rag build)"),
    }

    println!(
        "[*] 메모리 상태: {:?} (검색 {}), 그래프 {}",
        s.index_status,
        if s.index_ready { "가능" } else { "불가" },
        if s.ready { "준비됨" } else { "없음" }
    );
    println!(
        "     엔티티 {}, 관계 {}, 커뮤니티 {}",
        s.entity_count, s.relation_count, s.community_count
    );
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("재구매율\n지표", 20), "재구매율 지표");
    }

    #[test]
    fn test_parse_hybrid_flags() {
        let cli = Cli::try_parse_from(["insight-rag", "--json", "hybrid", "재구매율", "-k", "4", "--kg"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Hybrid { query, top_k, no_rerank, kg } => {
                assert_eq!(query, "재구매율");
                assert_eq!(top_k, Some(4));
                assert!(!no_rerank);
                assert!(kg);
            }
            _ => panic!("expected hybrid"),
        }
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["insight-rag", "build", "--force", "--docs", "/tmp/docs"]).unwrap();
        assert_eq!(cli.docs, Some(PathBuf::from("/tmp/docs")));
        assert!(matches!(cli.command, Commands::Build { force: true }));
    }
}
