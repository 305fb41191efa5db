//! 설정 모듈
//!
//! TOML 설정 파일(선택)과 환경변수에서 RAG 코어 설정을 읽습니다.
//! 모든 항목에 기본값이 있으므로 설정 파일 없이도 동작합니다.
//!
//! API 키는 파일에 두지 않고 환경변수(`GEMINI_API_KEY`, `GOOGLE_AI_API_KEY`)에서만 읽습니다.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.local/share/.insight-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".insight-rag")
}

// ============================================================================
// RagConfig
// ============================================================================

/// RAG 코어 전체 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// 인덱싱할 문서 루트
    pub docs_dir: PathBuf,
    /// 벡터 인덱스 + 사이드카 상태 파일 디렉토리
    pub index_dir: PathBuf,
    /// 수집 대상 확장자 (점 없이, 소문자)
    pub allowed_extensions: Vec<String>,
    /// 문서당 최대 문자 수
    pub max_doc_chars: usize,
    /// 결과 content 최대 문자 수
    pub snippet_chars: usize,
    pub default_top_k: usize,
    pub max_top_k: usize,
    /// 기본 검색에서 허용하는 최대 벡터 거리
    pub max_distance: f32,
    pub chunk: ChunkSettings,
    pub fusion: FusionSettings,
    pub rerank: RerankSettings,
    pub graph: GraphSettings,
    pub embedding: EmbeddingSettings,
    pub completion: CompletionSettings,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self::with_data_dir(&get_data_dir())
    }
}

impl RagConfig {
    /// 지정한 데이터 디렉토리 아래에 docs/index 경로를 둔 기본 설정
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            docs_dir: data_dir.join("rag_docs"),
            index_dir: data_dir.join("rag_index"),
            allowed_extensions: ["txt", "md", "json", "csv", "log", "pdf"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_doc_chars: 200_000,
            snippet_chars: 1200,
            default_top_k: 3,
            max_top_k: 10,
            max_distance: 1.6,
            chunk: ChunkSettings::default(),
            fusion: FusionSettings::default(),
            rerank: RerankSettings::default(),
            graph: GraphSettings::default(),
            embedding: EmbeddingSettings::default(),
            completion: CompletionSettings::default(),
        }
    }

    /// TOML 파일에서 로드
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let mut config: RagConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.normalize();
        Ok(config)
    }

    /// 설정 파일이 있으면 로드, 없으면 기본값
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default_path = get_data_dir().join("config.toml");
                if default_path.exists() {
                    Self::load(&default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// 요청 top_k를 [1, max_top_k] 범위로 제한
    pub fn clamp_top_k(&self, top_k: usize) -> usize {
        top_k.clamp(1, self.max_top_k.max(1))
    }

    /// 확장자 표기 정규화 (".PDF" -> "pdf")
    fn normalize(&mut self) {
        for ext in &mut self.allowed_extensions {
            *ext = ext.trim_start_matches('.').to_lowercase();
        }
    }

    /// 사이드카 상태 파일 경로
    pub fn state_file(&self) -> PathBuf {
        self.index_dir.join("rag_state.json")
    }

    /// 그래프 스냅샷 파일 경로
    pub fn graph_file(&self) -> PathBuf {
        self.index_dir.join("graph.json")
    }

    /// 벡터 테이블 세대 디렉토리들의 상위 경로 (빌드마다 하위 디렉토리 하나)
    pub fn vectors_dir(&self) -> PathBuf {
        self.index_dir.join("vectors")
    }
}

/// 청킹 설정 (문자 단위)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkSettings {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            size: 900,
            overlap: 150,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FusionSettings {
    /// RRF 상수 k
    pub rrf_k: f32,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self { rrf_k: 60.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RerankSettings {
    /// 재정렬 모델에 넘기는 content 접두사 길이
    pub prefix_chars: usize,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self { prefix_chars: 500 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphSettings {
    /// 추출 호출 대상 청크 상한 (비용 제한)
    pub chunk_limit: usize,
    pub max_text_chars: usize,
    pub min_chunk_chars: usize,
    /// 동시 추출 호출 수
    pub concurrency: usize,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            chunk_limit: 20,
            max_text_chars: 4000,
            min_chunk_chars: 50,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub model: String,
    pub dimension: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model: "gemini-embedding-001".to_string(),
            dimension: 768,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionSettings {
    pub model: String,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
