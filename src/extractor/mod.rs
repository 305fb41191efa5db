//! 문서 로더 & 정제 모듈
//!
//! 파일 형식별로 텍스트를 읽고(PDF는 pdf-extract로 추출),
//! 제어문자 제거 / 공백 정리 / 길이 제한 후 저품질(garbage) 텍스트를 걸러냅니다.

pub mod pdf;

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::collector::FileType;
use crate::error::LoadError;

/// garbage 판정 최소 길이 (문자 수)
pub const MIN_TEXT_CHARS: usize = 50;
/// 문자 다양도 하한 (고유 문자 수 / 전체 문자 수)
pub const MIN_DIVERSITY_RATIO: f64 = 0.02;
/// 의미 문자(영숫자, 모든 문자 체계) 비율 하한
pub const MIN_MEANINGFUL_RATIO: f64 = 0.2;

// ============================================================================
// Document
// ============================================================================

/// 정제된 문서 (빌드 파이프라인 내부에서만 사용)
#[derive(Debug, Clone)]
pub struct Document {
    pub text: String,
    /// 문서 루트 기준 상대경로
    pub source: String,
}

// ============================================================================
// Loader
// ============================================================================

/// 파일을 읽어 정제된 텍스트 반환
///
/// garbage로 판정되면 빈 문자열을 반환합니다 (에러 아님).
///
/// # Arguments
/// * `path` - 파일 경로
/// * `max_chars` - 문서당 최대 문자 수
pub fn load_document(path: &Path, max_chars: usize) -> Result<String, LoadError> {
    let raw = match FileType::from_path(path) {
        FileType::Pdf => pdf::extract_text_from_pdf(path)?,
        FileType::Text => {
            let bytes = std::fs::read(path).map_err(|source| LoadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            String::from_utf8_lossy(&bytes).into_owned()
        }
    };

    let truncated = truncate_chars(raw.trim(), max_chars);
    let cleaned = clean_text(truncated);

    if is_garbage_text(&cleaned) {
        return Ok(String::new());
    }

    Ok(cleaned)
}

// ============================================================================
// Cleaning
// ============================================================================

fn control_chars_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").expect("valid regex"))
}

fn inline_space_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t]+").expect("valid regex"))
}

fn blank_lines_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"))
}

/// 텍스트 정제
///
/// - 제어문자를 공백으로 치환 (개행/탭 유지)
/// - 연속 공백/탭을 하나로
/// - 3줄 이상 빈 줄을 2줄로
pub fn clean_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let text = text.replace("\r\n", "\n");
    let text = control_chars_re().replace_all(&text, " ");
    let text = inline_space_re().replace_all(&text, " ");
    let text = blank_lines_re().replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// 저품질 텍스트 판정
///
/// 너무 짧거나, 문자 다양도가 낮거나(반복/깨진 목차),
/// 의미 문자 비율이 낮으면(깨진 추출 결과) garbage입니다.
pub fn is_garbage_text(text: &str) -> bool {
    let t = text.trim();
    let total = t.chars().count();
    if total < MIN_TEXT_CHARS {
        return true;
    }

    let unique = t.chars().collect::<std::collections::HashSet<char>>().len();
    if (unique as f64) / (total as f64) < MIN_DIVERSITY_RATIO {
        return true;
    }

    let meaningful = t.chars().filter(|c| c.is_alphanumeric()).count();
    (meaningful as f64) / (total as f64) < MIN_MEANINGFUL_RATIO
}

/// 문자 단위 자르기 (UTF-8 안전)
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============================================================================
// Tests
// ============================================================================
