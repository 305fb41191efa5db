//! Keyword Index - 인메모리 SQLite FTS5 키워드 인덱스
//!
//! 청크 텍스트를 직접 색인하지 않고, 혼합 문자 체계용 토크나이저를 거친
//! 토큰 문자열을 색인합니다. 한글/한자/가나가 포함된 단어는 형태소 분석기
//! 대신 2글자 겹침 부분 토큰(bigram)을 추가로 만들어 부분 일치를 근사합니다.
//!
//! 코퍼스가 바뀔 때마다 메모리에서 통째로 다시 만들며 디스크에 저장하지 않습니다.
//! source: https://www.sqlite.org/fts5.html

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use super::chunker::Chunk;

// ============================================================================
// Types
// ============================================================================

/// 키워드 검색 결과
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub chunk: Chunk,
    /// BM25 점수 (높을수록 관련, 항상 > 0)
    pub score: f32,
}

/// FTS5 기반 키워드 인덱스
///
/// FTS5 rowid는 `chunks`의 위치와 같습니다.
pub struct KeywordIndex {
    conn: Mutex<Connection>,
    chunks: Vec<Chunk>,
}

impl KeywordIndex {
    /// 청크 목록으로 인덱스 생성
    pub fn build(chunks: &[Chunk]) -> Result<Self> {
        let mut conn =
            Connection::open_in_memory().context("Failed to open in-memory keyword index")?;

        conn.execute(
            "CREATE VIRTUAL TABLE chunks_fts USING fts5(
                tokens,
                tokenize='unicode61 remove_diacritics 0'
            )",
            [],
        )
        .context("FTS5 is not available")?;

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO chunks_fts(rowid, tokens) VALUES (?1, ?2)")?;
            for (i, chunk) in chunks.iter().enumerate() {
                let tokens = tokenize(&chunk.content).join(" ");
                stmt.execute(params![i as i64, tokens])?;
            }
        }
        tx.commit().context("Failed to commit keyword index")?;

        tracing::debug!("Built keyword index with {} chunks", chunks.len());

        Ok(Self {
            conn: Mutex::new(conn),
            chunks: chunks.to_vec(),
        })
    }

    /// 키워드 검색 (점수 내림차순)
    ///
    /// 쿼리 토큰 중 하나라도 일치하면 후보가 되며, 점수가 0 이하인 결과는 제외합니다.
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<KeywordHit>> {
        if k == 0 || self.chunks.is_empty() {
            return Ok(vec![]);
        }

        let match_expr = build_match_query(query);
        if match_expr.is_empty() {
            return Ok(vec![]);
        }

        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        // bm25()는 낮을수록 관련도가 높음 (음수)
        let mut stmt = conn.prepare(
            r#"
            SELECT rowid, bm25(chunks_fts)
            FROM chunks_fts
            WHERE chunks_fts MATCH ?1
            ORDER BY bm25(chunks_fts), rowid
            LIMIT ?2
            "#,
        )?;

        let rows = stmt
            .query_map(params![match_expr, k as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Keyword search failed")?;

        let hits = rows
            .into_iter()
            .filter_map(|(rowid, bm25)| {
                let score = (-bm25) as f32;
                if score <= 0.0 {
                    return None;
                }
                let chunk = self.chunks.get(usize::try_from(rowid).ok()?)?;
                Some(KeywordHit {
                    chunk: chunk.clone(),
                    score,
                })
            })
            .collect();

        Ok(hits)
    }

    /// 색인된 청크 수
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

/// 혼합 문자 체계 토크나이저
///
/// 공백 기준 분리 + 소문자화 후, 밀집 문자(한글/한자/가나)가 포함된 단어는
/// 겹치는 2글자 부분 토큰을 추가로 만듭니다.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();

    for word in text.split_whitespace() {
        let word = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if word.is_empty() {
            continue;
        }

        let dense = word.chars().any(is_dense_script);
        let chars: Vec<char> = word.chars().filter(|c| c.is_alphanumeric()).collect();
        tokens.push(word);

        if dense && chars.len() > 2 {
            for pair in chars.windows(2) {
                tokens.push(pair.iter().collect());
            }
        }
    }

    tokens
}

/// 한글, CJK 통합 한자, 히라가나/가타카나
fn is_dense_script(c: char) -> bool {
    matches!(c,
        '\u{AC00}'..='\u{D7A3}'
        | '\u{1100}'..='\u{11FF}'
        | '\u{3130}'..='\u{318F}'
        | '\u{3040}'..='\u{30FF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{4E00}'..='\u{9FFF}'
    )
}

/// FTS5 MATCH 식 생성
///
/// 각 토큰을 따옴표로 감싸 FTS5 연산자로 해석되지 않게 하고 OR로 잇습니다.
/// source: https://www.sqlite.org/fts5.html#full_text_query_syntax
fn build_match_query(query: &str) -> String {
    let mut seen = HashSet::new();

    tokenize(query)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ============================================================================
// Tests
// ============================================================================
