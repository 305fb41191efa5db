//! 단위 작업 에러 타입
//!
//! 빌드 파이프라인은 파일/청크 단위 실패를 중단 없이 건너뛰고,
//! 이 타입들로 집계하여 `BuildReport`에 남깁니다.

use std::path::PathBuf;

use thiserror::Error;

/// 문서 로드 실패
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to extract text from PDF {path:?}: {message}")]
    Pdf { path: PathBuf, message: String },
}

/// 청크 단위 엔티티/관계 추출 실패
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("completion request failed: {0}")]
    Completion(String),

    #[error("malformed extraction response: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("empty extraction response")]
    Empty,
}

/// 청크 단위 임베딩 실패
#[derive(Debug, Error)]
#[error("embedding failed for {source_path}#{chunk_index}: {message}")]
pub struct EmbedError {
    pub source_path: String,
    pub chunk_index: usize,
    pub message: String,
}
