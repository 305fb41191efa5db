//! LanceDB Vector Index - 디스크 영속 벡터 인덱스
//!
//! 인덱스 디렉토리에 LanceDB 테이블을 기록하고, 같은 지문이면 다시 엽니다.
//! 일부 파일시스템/로케일 조합에서 대상 경로에 직접 쓰기/열기가 실패하면
//! 임시 디렉토리에서 작업한 뒤 파일을 복사하는 방식으로 우회합니다.
//! ref: https://lancedb.github.io/lancedb/

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int32Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::table::Table;
use tempfile::TempDir;
use walkdir::WalkDir;

use super::chunker::Chunk;
use super::vector::{VectorEntry, VectorHit, VectorIndex};

/// 벡터 테이블 이름
const TABLE_NAME: &str = "chunks";

// ============================================================================
// LanceVectorIndex
// ============================================================================

/// LanceDB 벡터 인덱스
pub struct LanceVectorIndex {
    table: Table,
    dimension: usize,
    /// 임시 디렉토리 경유로 열었을 때 수명 유지용
    _staging: Option<TempDir>,
}

impl LanceVectorIndex {
    /// 엔트리로 인덱스를 새로 만들어 `dir`에 저장
    ///
    /// 기존 테이블은 교체됩니다.
    pub async fn create(dir: &Path, entries: &[VectorEntry], dimension: usize) -> Result<Self> {
        if entries.is_empty() {
            anyhow::bail!("Cannot build vector index from empty entries");
        }

        match write_table(dir, entries, dimension).await {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(
                    "Direct vector index save failed ({}), staging through temp dir",
                    e
                );
                let staging = TempDir::new().context("Failed to create staging dir")?;
                write_table(staging.path(), entries, dimension).await?;
                copy_dir_all(staging.path(), dir)?;
            }
        }

        Self::open(dir, dimension).await
    }

    /// 저장된 인덱스 열기
    pub async fn open(dir: &Path, dimension: usize) -> Result<Self> {
        match open_table(dir).await {
            Ok(table) => Ok(Self {
                table,
                dimension,
                _staging: None,
            }),
            Err(e) => {
                tracing::warn!(
                    "Direct vector index load failed ({}), staging through temp dir",
                    e
                );
                let staging = TempDir::new().context("Failed to create staging dir")?;
                copy_dir_all(dir, staging.path())?;
                let table = open_table(staging.path()).await?;
                Ok(Self {
                    table,
                    dimension,
                    _staging: Some(staging),
                })
            }
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// 벡터 테이블 스키마
    fn create_schema(dimension: usize) -> Schema {
        Schema::new(vec![
            Field::new("source", DataType::Utf8, false),
            Field::new("chunk_index", DataType::Int32, false),
            Field::new("content", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension as i32,
                ),
                false,
            ),
        ])
    }

    /// 엔트리들을 Arrow RecordBatch로 변환
    fn entries_to_batch(entries: &[VectorEntry], dimension: usize) -> Result<RecordBatch> {
        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != dimension) {
            anyhow::bail!(
                "Embedding dimension mismatch for {}#{}: expected {}, got {}",
                bad.chunk.source,
                bad.chunk.chunk_index,
                dimension,
                bad.embedding.len()
            );
        }

        let sources: Vec<&str> = entries.iter().map(|e| e.chunk.source.as_str()).collect();
        let chunk_indices: Vec<i32> = entries.iter().map(|e| e.chunk.chunk_index as i32).collect();
        let contents: Vec<&str> = entries.iter().map(|e| e.chunk.content.as_str()).collect();

        let embeddings_flat: Vec<f32> = entries
            .iter()
            .flat_map(|e| e.embedding.iter().copied())
            .collect();

        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .context("Failed to create embedding array")?;

        RecordBatch::try_new(
            Arc::new(Self::create_schema(dimension)),
            vec![
                Arc::new(StringArray::from(sources)),
                Arc::new(Int32Array::from(chunk_indices)),
                Arc::new(StringArray::from(contents)),
                Arc::new(embeddings_list),
            ],
        )
        .context("Failed to create RecordBatch")
    }
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
    async fn search(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let results = self
            .table
            .vector_search(query_embedding.to_vec())
            .context("Failed to create vector search")?
            .limit(limit)
            .execute()
            .await
            .context("Failed to execute vector search")?;

        let batches: Vec<RecordBatch> = results.try_collect().await?;
        let mut hits = Vec::new();

        for batch in batches {
            let sources = batch
                .column_by_name("source")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| anyhow::anyhow!("Missing source column"))?;

            let chunk_indices = batch
                .column_by_name("chunk_index")
                .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
                .ok_or_else(|| anyhow::anyhow!("Missing chunk_index column"))?;

            let contents = batch
                .column_by_name("content")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| anyhow::anyhow!("Missing content column"))?;

            // _distance 컬럼 (LanceDB가 자동 추가)
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| anyhow::anyhow!("Missing _distance column"))?;

            for i in 0..batch.num_rows() {
                hits.push(VectorHit {
                    chunk: Chunk {
                        content: contents.value(i).to_string(),
                        source: sources.value(i).to_string(),
                        chunk_index: chunk_indices.value(i).max(0) as usize,
                    },
                    distance: distances.value(i),
                });
            }
        }

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        self.table
            .count_rows(None)
            .await
            .context("Failed to count rows")
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

async fn connect(dir: &Path) -> Result<lancedb::connection::Connection> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create index directory: {:?}", dir))?;

    let path_str = dir
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid path encoding: {:?}", dir))?;

    lancedb::connect(path_str)
        .execute()
        .await
        .context("Failed to connect to LanceDB")
}

/// 테이블 디렉토리를 비우고 새로 기록
async fn write_table(dir: &Path, entries: &[VectorEntry], dimension: usize) -> Result<()> {
    let table_dir = table_dir(dir);
    if table_dir.exists() {
        tokio::fs::remove_dir_all(&table_dir)
            .await
            .with_context(|| format!("Failed to remove stale table: {:?}", table_dir))?;
    }

    let db = connect(dir).await?;
    let batch = LanceVectorIndex::entries_to_batch(entries, dimension)?;
    let schema = batch.schema();
    let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

    db.create_table(TABLE_NAME, batches)
        .execute()
        .await
        .context("Failed to create vector table")?;

    tracing::debug!("Wrote {} vectors to {:?}", entries.len(), dir);
    Ok(())
}

async fn open_table(dir: &Path) -> Result<Table> {
    if !table_dir(dir).exists() {
        anyhow::bail!("Vector table not found in {:?}", dir);
    }

    let db = connect(dir).await?;
    db.open_table(TABLE_NAME)
        .execute()
        .await
        .context("Failed to open vector table")
}

fn table_dir(dir: &Path) -> PathBuf {
    dir.join(format!("{}.lance", TABLE_NAME))
}

/// 디렉토리 재귀 복사 (대상에 같은 이름 파일은 덮어씀)
fn copy_dir_all(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.with_context(|| format!("Failed to walk {:?}", from))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .context("Walked outside of source dir")?;
        let target = to.join(rel);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {:?}", target))?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {:?} -> {:?}", entry.path(), target))?;
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DIM: usize = 4;

    fn entry(source: &str, chunk_index: usize, embedding: [f32; DIM]) -> VectorEntry {
        VectorEntry {
            chunk: Chunk {
                content: format!("chunk {} of {}", chunk_index, source),
                source: source.to_string(),
                chunk_index,
            },
            embedding: embedding.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_create_and_search() {
        let dir = TempDir::new().unwrap();
        let entries = vec![
            entry("a.md", 0, [1.0, 0.0, 0.0, 0.0]),
            entry("b.md", 0, [0.0, 1.0, 0.0, 0.0]),
            entry("c.md", 0, [0.0, 0.0, 1.0, 0.0]),
        ];

        let index = LanceVectorIndex::create(dir.path(), &entries, DIM).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 3);

        let hits = index.search(&[0.9, 0.1, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.source, "a.md");
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn test_reopen_persisted_index() {
        let dir = TempDir::new().unwrap();
        let entries = vec![entry("a.md", 3, [0.5, 0.5, 0.0, 0.0])];
        LanceVectorIndex::create(dir.path(), &entries, DIM).await.unwrap();

        let reopened = LanceVectorIndex::open(dir.path(), DIM).await.unwrap();
        let hits = reopened.search(&[0.5, 0.5, 0.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.chunk_index, 3);
    }

    #[tokio::test]
    async fn test_create_replaces_existing_table() {
        let dir = TempDir::new().unwrap();
        LanceVectorIndex::create(dir.path(), &[entry("old.md", 0, [1.0, 0.0, 0.0, 0.0])], DIM)
            .await
            .unwrap();
        let index = LanceVectorIndex::create(
            dir.path(),
            &[
                entry("new.md", 0, [1.0, 0.0, 0.0, 0.0]),
                entry("new.md", 1, [0.0, 1.0, 0.0, 0.0]),
            ],
            DIM,
        )
        .await
        .unwrap();

        assert_eq!(index.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_error() {
        let dir = TempDir::new().unwrap();
        let mut bad = entry("a.md", 0, [1.0, 0.0, 0.0, 0.0]);
        bad.embedding.push(1.0);
        assert!(LanceVectorIndex::create(dir.path(), &[bad], DIM).await.is_err());
    }

    #[tokio::test]
    async fn test_open_missing_index_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(LanceVectorIndex::open(dir.path(), DIM).await.is_err());
    }

    #[test]
    fn test_copy_dir_all() {
        let from = TempDir::new().unwrap();
        let to = TempDir::new().unwrap();
        std::fs::create_dir_all(from.path().join("x/y")).unwrap();
        std::fs::write(from.path().join("x/y/file.bin"), b"data").unwrap();

        copy_dir_all(from.path(), to.path()).unwrap();
        assert_eq!(std::fs::read(to.path().join("x/y/file.bin")).unwrap(), b"data");
    }
}
