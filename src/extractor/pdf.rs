//! PDF 텍스트 추출 모듈
//!
//! pdf-extract 크레이트로 PDF 전체 텍스트를 추출합니다.
//! 페이지 구분(폼피드)은 개행으로 바꿔 하나의 문서로 합칩니다.

use std::path::Path;

use crate::error::LoadError;

/// PDF에서 텍스트 추출
///
/// 스캔 이미지 PDF처럼 텍스트가 없으면 빈 문자열을 반환합니다.
pub fn extract_text_from_pdf(path: &Path) -> Result<String, LoadError> {
    let bytes = std::fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    // pdf-extract는 손상된 파일에서 panic할 수 있음
    let extracted = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(&bytes));

    let text = match extracted {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            return Err(LoadError::Pdf {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
        Err(_) => {
            return Err(LoadError::Pdf {
                path: path.to_path_buf(),
                message: "extractor panicked".to_string(),
            })
        }
    };

    if text.trim().is_empty() {
        tracing::warn!(
            "No text extracted from PDF: {:?}. It might be a scanned document.",
            path
        );
        return Ok(String::new());
    }

    Ok(join_pages(&text))
}

/// 폼피드로 나뉜 페이지를 개행으로 연결
fn join_pages(text: &str) -> String {
    text.split('\x0c')
        .map(str::trim)
        .filter(|page| !page.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_join_pages_with_formfeed() {
        let text = "Page 1 content\x0c\x0cPage 2 content\x0c  ";
        assert_eq!(join_pages(text), "Page 1 content\nPage 2 content");
    }

    #[test]
    fn test_invalid_pdf_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"not a pdf at all").unwrap();

        let result = extract_text_from_pdf(&path);
        assert!(matches!(result, Err(LoadError::Pdf { .. })));
    }
}
