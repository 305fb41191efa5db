//! 코퍼스 수집 모듈
//!
//! 문서 루트 아래의 허용된 확장자 파일을 수집하고,
//! (상대경로, 크기, 수정시간) 목록으로 코퍼스 지문(fingerprint)을 계산합니다.
//! 지문이 바뀌면 디스크에 캐시된 인덱스는 더 이상 유효하지 않습니다.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

// ============================================================================
// File Types
// ============================================================================

/// 로더가 구분하는 파일 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// UTF-8 텍스트로 읽는 파일
    Text,
    /// 텍스트 추출이 필요한 PDF
    Pdf,
}

impl FileType {
    /// 경로의 확장자로 타입 결정
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref()
        {
            Some("pdf") => FileType::Pdf,
            _ => FileType::Text,
        }
    }
}

// ============================================================================
// SourceFile
// ============================================================================

/// 지문 계산용 파일 메타데이터
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified_at: Option<SystemTime>,
}

impl SourceFile {
    /// 파일 메타데이터 읽기
    pub fn stat(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            modified_at: metadata.modified().ok(),
        })
    }

    /// 수정 시간 (UNIX 초)
    pub fn modified_secs(&self) -> u64 {
        self.modified_at
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

// ============================================================================
// Corpus Scanner
// ============================================================================

/// 문서 루트 스캐너
#[derive(Debug, Clone)]
pub struct CorpusScanner {
    root: PathBuf,
    extensions: Vec<String>,
}

impl CorpusScanner {
    /// 새 스캐너 생성
    ///
    /// # Arguments
    /// * `root` - 문서 루트 디렉토리
    /// * `extensions` - 허용 확장자 (점 없이)
    pub fn new(root: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            root: root.into(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 허용된 확장자의 파일을 재귀 수집 (정렬, 중복 제거)
    pub fn scan(&self) -> Result<Vec<PathBuf>> {
        if !self.root.is_dir() {
            anyhow::bail!("Corpus directory not found: {:?}", self.root);
        }

        let mut files = Vec::new();

        for entry in WalkDir::new(&self.root).follow_links(true) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Failed to read entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            if self.is_allowed(entry.path()) {
                files.push(entry.into_path());
            }
        }

        files.sort();
        files.dedup();

        tracing::debug!("Scanned {} files from {:?}", files.len(), self.root);
        Ok(files)
    }

    fn is_allowed(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    /// 루트 기준 상대경로 ('/' 구분자)
    pub fn relative_path(&self, path: &Path) -> String {
        relative_path(&self.root, path)
    }

    /// 파일 목록의 지문 계산
    ///
    /// 경로를 정렬한 뒤 `relpath|size|mtime` 줄을 SHA-256으로 해시합니다.
    /// stat에 실패한 파일은 `relpath|ERR`로 기록되어 지문에 반영됩니다.
    pub fn fingerprint(&self, paths: &[PathBuf]) -> String {
        let mut sorted: Vec<&PathBuf> = paths.iter().collect();
        sorted.sort();
        sorted.dedup();

        let lines: Vec<String> = sorted
            .into_iter()
            .map(|p| {
                let rel = self.relative_path(p);
                match SourceFile::stat(p) {
                    Ok(file) => format!("{}|{}|{}", rel, file.size, file.modified_secs()),
                    Err(e) => {
                        tracing::warn!("Failed to stat {:?}: {}", p, e);
                        format!("{}|ERR", rel)
                    }
                }
            })
            .collect();

        sha256_hex(&lines.join("\n"))
    }

    /// 스캔 + 지문을 한 번에
    pub fn snapshot(&self) -> Result<(Vec<PathBuf>, String)> {
        let files = self
            .scan()
            .with_context(|| format!("Failed to scan corpus: {:?}", self.root))?;
        let fingerprint = self.fingerprint(&files);
        Ok((files, fingerprint))
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// `root` 기준 상대경로 ('/' 구분자). root 밖이면 전체 경로
pub fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Tests
// ============================================================================
