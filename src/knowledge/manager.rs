//! Index Manager - 인덱스 상태와 빌드 파이프라인
//!
//! 벡터/키워드 인덱스와 지식 그래프 핸들을 하나의 불변 스냅샷(`IndexSnapshot`)으로
//! 묶고, 스냅샷 교체는 하나의 뮤텍스 아래에서만 일어납니다.
//!
//! ## 빌드 직렬화
//! 비싼 작업(임베딩/추출 호출)은 락 밖에서 실행합니다. 대신 "빌드 중" 플래그를
//! 같은 락 아래에서 확인/설정하므로 동시에 들어온 두 번째 호출은 새 빌드를
//! 시작하지 않고 진행 중인 빌드가 끝나기를 기다려 그 결과를 그대로 씁니다.
//!
//! ## 파이프라인
//! ```text
//! scan -> fingerprint -> (사이드카 지문 일치) -> 디스크 벡터 인덱스 재사용
//!                     -> (불일치) load -> chunk -> embed -> {vector, keyword, graph}
//! ```
//!
//! ## 벡터 테이블 세대
//! 전체 재빌드는 `vectors/<세대>/`에 새 테이블을 기록하고, 서비스 중인 스냅샷의
//! 테이블은 건드리지 않습니다. 교체된 스냅샷의 세대는 다음 재빌드가 시작될 때 정리합니다.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::chunker::{chunker_for, Chunk, ChunkConfig};
use super::keyword::KeywordIndex;
use super::lance::LanceVectorIndex;
use super::vector::{VectorEntry, VectorIndex};
use crate::collector::{relative_path, CorpusScanner};
use crate::completion::{create_completer, CompletionProvider};
use crate::config::RagConfig;
use crate::embedding::{create_embedder, EmbeddingProvider};
use crate::error::{EmbedError, LoadError};
use crate::extractor::{load_document, Document};
use crate::graph::{build_graph, GraphBuildReport, GraphState};

// ============================================================================
// Index Snapshot
// ============================================================================

/// 인덱스 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    /// 아직 빌드/로드하지 않음
    NotBuilt,
    /// 검색 가능
    Ready,
    /// 사용할 수 있는 문서가 없음 (에러 아님)
    Empty,
    /// 빌드 실패 (설정 오류 포함)
    Failed,
}

/// 한 시점의 인덱스 핸들 묶음 (생성 후 불변)
///
/// `status == Ready`이면 벡터/키워드 핸들이 모두 존재합니다.
pub struct IndexSnapshot {
    pub status: IndexStatus,
    pub fingerprint: Option<String>,
    pub vector: Option<Arc<dyn VectorIndex>>,
    pub keyword: Option<Arc<KeywordIndex>>,
    pub graph: Arc<GraphState>,
    /// 벡터 테이블 세대 디렉토리 이름 (`vectors/` 기준)
    pub generation: Option<String>,
    pub files_count: usize,
    pub chunks_count: usize,
    pub last_build: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl IndexSnapshot {
    pub fn not_built() -> Self {
        Self {
            status: IndexStatus::NotBuilt,
            fingerprint: None,
            vector: None,
            keyword: None,
            graph: Arc::new(GraphState::empty()),
            generation: None,
            files_count: 0,
            chunks_count: 0,
            last_build: None,
            last_error: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn ready(
        fingerprint: String,
        generation: String,
        vector: Arc<dyn VectorIndex>,
        keyword: Arc<KeywordIndex>,
        graph: GraphState,
        files_count: usize,
        chunks_count: usize,
        last_build: DateTime<Utc>,
    ) -> Self {
        Self {
            status: IndexStatus::Ready,
            fingerprint: Some(fingerprint),
            vector: Some(vector),
            keyword: Some(keyword),
            graph: Arc::new(graph),
            generation: Some(generation),
            files_count,
            chunks_count,
            last_build: Some(last_build),
            last_error: None,
        }
    }

    fn not_ready(status: IndexStatus, fingerprint: Option<String>, error: String) -> Self {
        Self {
            status,
            fingerprint,
            last_build: Some(Utc::now()),
            last_error: Some(error),
            ..Self::not_built()
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == IndexStatus::Ready && self.vector.is_some() && self.keyword.is_some()
    }
}

// ============================================================================
// Build Report
// ============================================================================

/// 빌드 한 번의 단위 작업 결과 집계
#[derive(Debug, Default)]
pub struct BuildReport {
    /// 디스크 인덱스를 재사용했는지 (임베딩 호출 없음)
    pub reused_cache: bool,
    pub files_scanned: usize,
    pub documents_loaded: usize,
    /// garbage 판정으로 제외된 문서 수
    pub documents_rejected: usize,
    pub load_failures: Vec<LoadError>,
    pub chunks: usize,
    pub embedded: usize,
    pub embed_failures: Vec<EmbedError>,
    pub graph: Option<GraphBuildReport>,
}

impl BuildReport {
    fn log_summary(&self) {
        tracing::info!(
            "Index build summary: files={} docs={} rejected={} load_failures={} chunks={} embedded={} embed_failures={} cache={}",
            self.files_scanned,
            self.documents_loaded,
            self.documents_rejected,
            self.load_failures.len(),
            self.chunks,
            self.embedded,
            self.embed_failures.len(),
            self.reused_cache
        );
    }
}

// ============================================================================
// Sidecar State File
// ============================================================================

/// 인덱스 디렉토리의 사이드카 상태 파일 (rag_state.json)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateFile {
    pub fingerprint: String,
    pub files_count: usize,
    pub chunks_count: usize,
    pub last_build: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub embed_model: String,
    pub dimension: usize,
    /// 벡터 테이블 세대 디렉토리 이름
    pub vector_dir: String,
    pub keyword_ready: bool,
    pub graph_ready: bool,
}

impl StateFile {
    pub fn load(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!("Ignoring unreadable state file {:?}: {}", path, e);
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))
    }
}

// ============================================================================
// Index Manager
// ============================================================================

struct ManagerState {
    snapshot: Arc<IndexSnapshot>,
    building: bool,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    completer: Option<Arc<dyn CompletionProvider>>,
    last_report: Option<Arc<BuildReport>>,
}

/// 프로세스 단위 인덱스 관리자
pub struct IndexManager {
    config: RagConfig,
    state: Mutex<ManagerState>,
    build_done: Notify,
    full_builds: AtomicUsize,
}

/// 빌드 플래그 소유권
///
/// 정상 종료 시 `finish`로 스냅샷을 교체하고, 중간에 drop되면 플래그만 해제합니다.
struct BuildSlot<'a> {
    manager: &'a IndexManager,
    finished: bool,
}

impl BuildSlot<'_> {
    fn finish(mut self, snapshot: IndexSnapshot, report: BuildReport) -> Arc<IndexSnapshot> {
        let snapshot = Arc::new(snapshot);
        {
            let mut st = self.manager.lock_state();
            st.snapshot = Arc::clone(&snapshot);
            st.last_report = Some(Arc::new(report));
            st.building = false;
        }
        self.finished = true;
        self.manager.build_done.notify_waiters();
        snapshot
    }
}

impl Drop for BuildSlot<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.manager.lock_state().building = false;
            self.manager.build_done.notify_waiters();
        }
    }
}

impl IndexManager {
    /// 프로바이더 없이 생성 (빌드 시 Failed)
    pub fn new(config: RagConfig) -> Self {
        Self::with_providers(config, None, None)
    }

    pub fn with_providers(
        config: RagConfig,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        completer: Option<Arc<dyn CompletionProvider>>,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(ManagerState {
                snapshot: Arc::new(IndexSnapshot::not_built()),
                building: false,
                embedder,
                completer,
                last_report: None,
            }),
            build_done: Notify::new(),
            full_builds: AtomicUsize::new(0),
        }
    }

    /// 환경변수 API 키로 Gemini 프로바이더를 붙여 생성
    ///
    /// 키가 없으면 경고만 남기고 프로바이더 없이 생성합니다.
    pub fn from_env(config: RagConfig) -> Self {
        let embedder: Option<Arc<dyn EmbeddingProvider>> =
            match create_embedder(&config.embedding, None) {
                Ok(e) => Some(Arc::new(e)),
                Err(e) => {
                    tracing::warn!("Embedding provider unavailable: {:#}", e);
                    None
                }
            };
        let completer: Option<Arc<dyn CompletionProvider>> =
            match create_completer(&config.completion, None) {
                Ok(c) => Some(Arc::new(c)),
                Err(e) => {
                    tracing::warn!("Completion provider unavailable, graph disabled: {:#}", e);
                    None
                }
            };
        Self::with_providers(config, embedder, completer)
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 현재 스냅샷 (락 1회 획득)
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.lock_state().snapshot)
    }

    pub fn last_report(&self) -> Option<Arc<BuildReport>> {
        self.lock_state().last_report.clone()
    }

    /// 전체 재빌드(임베딩 포함)가 실행된 횟수
    pub fn full_build_count(&self) -> usize {
        self.full_builds.load(Ordering::SeqCst)
    }

    pub fn embedder(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        self.lock_state().embedder.clone()
    }

    pub fn set_embedder(&self, embedder: Arc<dyn EmbeddingProvider>) {
        self.lock_state().embedder = Some(embedder);
    }

    pub fn set_completer(&self, completer: Arc<dyn CompletionProvider>) {
        self.lock_state().completer = Some(completer);
    }

    /// 임베딩 프로바이더가 없으면 요청 키로 Gemini 임베딩 설치
    pub fn ensure_embedder(&self, api_key: Option<&str>) -> Result<()> {
        if self.embedder().is_some() {
            return Ok(());
        }
        let embedder = create_embedder(&self.config.embedding, api_key)?;
        let mut st = self.lock_state();
        if st.embedder.is_none() {
            st.embedder = Some(Arc::new(embedder));
        }
        Ok(())
    }

    /// 준비된 스냅샷 반환 (준비되지 않았으면 빌드/로드 후 반환)
    pub async fn ensure_ready(&self) -> Arc<IndexSnapshot> {
        let snapshot = self.snapshot();
        if snapshot.is_ready() {
            return snapshot;
        }
        self.build_or_load(false).await
    }

    /// 인덱스 빌드 또는 디스크 로드
    ///
    /// 빌드가 이미 진행 중이면 끝날 때까지 기다린 뒤 그 결과를 반환합니다.
    /// `force`이면 지문이 같아도 디스크 캐시를 무시하고 다시 만듭니다.
    pub async fn build_or_load(&self, force: bool) -> Arc<IndexSnapshot> {
        let waiter = {
            let mut st = self.lock_state();
            if st.building {
                Some(self.build_done.notified())
            } else {
                st.building = true;
                None
            }
        };

        if let Some(notified) = waiter {
            tracing::debug!("Index build in progress, waiting for its result");
            notified.await;
            return self.snapshot();
        }

        let slot = BuildSlot {
            manager: self,
            finished: false,
        };

        let (embedder, completer, current) = {
            let st = self.lock_state();
            (st.embedder.clone(), st.completer.clone(), Arc::clone(&st.snapshot))
        };

        let mut report = BuildReport::default();
        let snapshot = self
            .run_pipeline(embedder, completer, &current, force, &mut report)
            .await;

        match snapshot {
            Ok(Some(snapshot)) => {
                report.log_summary();
                slot.finish(snapshot, report)
            }
            Ok(None) => {
                // 지문이 같아 현재 스냅샷 유지
                drop(slot);
                current
            }
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::warn!("Index build failed: {}", message);
                let fingerprint = current.fingerprint.clone();
                slot.finish(
                    IndexSnapshot::not_ready(IndexStatus::Failed, fingerprint, message),
                    report,
                )
            }
        }
    }

    /// 빌드 파이프라인 본체
    ///
    /// `Ok(None)`은 현재 스냅샷이 최신이라 교체할 필요가 없다는 뜻입니다.
    async fn run_pipeline(
        &self,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        completer: Option<Arc<dyn CompletionProvider>>,
        current: &IndexSnapshot,
        force: bool,
        report: &mut BuildReport,
    ) -> Result<Option<IndexSnapshot>> {
        let config = &self.config;

        let embedder = embedder.ok_or_else(|| {
            anyhow::anyhow!(
                "Embeddings unavailable: no embedding provider (set GEMINI_API_KEY or GOOGLE_AI_API_KEY)"
            )
        })?;

        // 1. scan + fingerprint
        let scanner = CorpusScanner::new(&config.docs_dir, &config.allowed_extensions);
        let (files, fingerprint) = tokio::task::spawn_blocking(move || scanner.snapshot())
            .await
            .context("Corpus scan task failed")??;
        report.files_scanned = files.len();
        tracing::info!(
            "Scanned {} files in {:?} (fingerprint {})",
            files.len(),
            config.docs_dir,
            short(&fingerprint)
        );

        let unchanged = current.fingerprint.as_deref() == Some(fingerprint.as_str());
        if !force
            && unchanged
            && matches!(current.status, IndexStatus::Ready | IndexStatus::Empty)
        {
            tracing::debug!("Corpus unchanged, keeping current index");
            return Ok(None);
        }

        // 2. 사이드카 지문이 같으면 디스크 인덱스 재사용
        if !force {
            if let Some(snapshot) = self
                .try_load_cached(&files, &fingerprint, embedder.as_ref(), report)
                .await
            {
                return Ok(Some(snapshot));
            }
        }

        // 3. 전체 재빌드
        self.full_builds.fetch_add(1, Ordering::SeqCst);
        tracing::info!("Rebuilding index from {} files", files.len());

        let chunks = self.load_and_chunk(files.clone(), report).await?;
        if chunks.is_empty() {
            let message = format!("No usable documents found in {:?}", config.docs_dir);
            tracing::info!("{}", message);
            self.write_state(&StateFile {
                fingerprint: fingerprint.clone(),
                files_count: files.len(),
                last_build: Some(Utc::now()),
                error: Some(message.clone()),
                embed_model: embedder.name().to_string(),
                dimension: embedder.dimension(),
                ..StateFile::default()
            });
            return Ok(Some(IndexSnapshot::not_ready(
                IndexStatus::Empty,
                Some(fingerprint),
                message,
            )));
        }

        // 4. embed
        let entries = embed_chunks(embedder.as_ref(), &chunks, report).await;
        if entries.is_empty() {
            let cause = report
                .embed_failures
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "no embeddings returned".to_string());
            let message = format!("Embeddings unavailable: {}", cause);
            self.write_state(&StateFile {
                fingerprint: fingerprint.clone(),
                files_count: files.len(),
                chunks_count: chunks.len(),
                last_build: Some(Utc::now()),
                error: Some(message.clone()),
                embed_model: embedder.name().to_string(),
                dimension: embedder.dimension(),
                ..StateFile::default()
            });
            anyhow::bail!(message);
        }

        // 5. vector + keyword (새 세대 디렉토리에 기록)
        let vectors_dir = config.vectors_dir();
        prune_generations(&vectors_dir, current.generation.as_deref());
        let generation = next_generation(&vectors_dir, &fingerprint);
        let vector = LanceVectorIndex::create(
            &vectors_dir.join(&generation),
            &entries,
            embedder.dimension(),
        )
        .await
        .context("Failed to build vector index")?;
        let keyword = build_keyword_index(chunks.clone()).await?;

        // 6. graph
        let graph = match completer {
            Some(completer) => {
                let (graph, graph_report) =
                    build_graph(completer.as_ref(), &chunks, &config.graph).await;
                report.graph = Some(graph_report);
                if graph.is_ready() {
                    if let Err(e) = graph.save(&config.graph_file()) {
                        tracing::warn!("Failed to save graph: {:#}", e);
                    }
                } else {
                    remove_stale(&config.graph_file());
                }
                graph
            }
            None => {
                tracing::info!("No completion provider, skipping knowledge graph");
                remove_stale(&config.graph_file());
                GraphState::empty()
            }
        };

        let now = Utc::now();
        self.write_state(&StateFile {
            fingerprint: fingerprint.clone(),
            files_count: files.len(),
            chunks_count: chunks.len(),
            last_build: Some(now),
            error: None,
            embed_model: embedder.name().to_string(),
            dimension: embedder.dimension(),
            vector_dir: generation.clone(),
            keyword_ready: true,
            graph_ready: graph.is_ready(),
        });

        tracing::info!(
            "Index ready: {} files, {} chunks ({} embedded), graph entities {}",
            files.len(),
            chunks.len(),
            entries.len(),
            graph.entities().len()
        );

        Ok(Some(IndexSnapshot::ready(
            fingerprint,
            generation,
            Arc::new(vector),
            Arc::new(keyword),
            graph,
            files.len(),
            chunks.len(),
            now,
        )))
    }

    /// 사이드카 지문이 일치하면 디스크의 벡터 인덱스/그래프를 열고 키워드 인덱스만 재구성
    async fn try_load_cached(
        &self,
        files: &[PathBuf],
        fingerprint: &str,
        embedder: &dyn EmbeddingProvider,
        report: &mut BuildReport,
    ) -> Option<IndexSnapshot> {
        let config = &self.config;
        let state = StateFile::load(&config.state_file())?;

        if state.fingerprint != fingerprint
            || state.chunks_count == 0
            || state.vector_dir.is_empty()
            || state.embed_model != embedder.name()
            || state.dimension != embedder.dimension()
        {
            tracing::debug!("State file does not match current corpus, rebuilding");
            return None;
        }

        let vector_dir = config.vectors_dir().join(&state.vector_dir);
        let vector = match LanceVectorIndex::open(&vector_dir, state.dimension).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Cached vector index unusable, rebuilding: {:#}", e);
                return None;
            }
        };

        let chunks = match self.load_and_chunk(files.to_vec(), report).await {
            Ok(c) if !c.is_empty() => c,
            Ok(_) => return None,
            Err(e) => {
                tracing::warn!("Failed to reload chunks for keyword index: {:#}", e);
                return None;
            }
        };
        let keyword = match build_keyword_index(chunks.clone()).await {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!("Failed to rebuild keyword index: {:#}", e);
                return None;
            }
        };

        let graph_path = config.graph_file();
        let graph = if state.graph_ready && graph_path.exists() {
            GraphState::load(&graph_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to restore graph: {:#}", e);
                GraphState::empty()
            })
        } else {
            GraphState::empty()
        };

        report.reused_cache = true;
        tracing::info!(
            "Loaded cached index: {} chunks, graph entities {}",
            chunks.len(),
            graph.entities().len()
        );

        Some(IndexSnapshot::ready(
            fingerprint.to_string(),
            state.vector_dir.clone(),
            Arc::new(vector),
            Arc::new(keyword),
            graph,
            files.len(),
            chunks.len(),
            state.last_build.unwrap_or_else(Utc::now),
        ))
    }

    /// 문서 로드 + 청킹 (블로킹 I/O는 별도 스레드)
    async fn load_and_chunk(&self, files: Vec<PathBuf>, report: &mut BuildReport) -> Result<Vec<Chunk>> {
        let root = self.config.docs_dir.clone();
        let max_chars = self.config.max_doc_chars;
        let chunk_config = ChunkConfig {
            size: self.config.chunk.size,
            overlap: self.config.chunk.overlap,
        };

        let loaded = tokio::task::spawn_blocking(move || {
            let corpus = load_corpus(&root, &files, max_chars);
            let chunks = chunker_for(chunk_config).chunk_documents(&corpus.documents);
            (corpus, chunks)
        })
        .await
        .context("Document loading task failed")?;

        let (corpus, chunks) = loaded;
        report.documents_loaded = corpus.documents.len();
        report.documents_rejected = corpus.rejected;
        report.load_failures = corpus.failures;
        report.chunks = chunks.len();
        Ok(chunks)
    }

    fn write_state(&self, state: &StateFile) {
        if let Err(e) = state.save(&self.config.state_file()) {
            tracing::warn!("Failed to write state file: {:#}", e);
        }
    }
}

// ============================================================================
// Pipeline Steps
// ============================================================================

struct LoadedCorpus {
    documents: Vec<Document>,
    rejected: usize,
    failures: Vec<LoadError>,
}

/// 파일을 읽어 정제 (garbage는 제외, 실패는 기록 후 건너뜀)
fn load_corpus(root: &Path, files: &[PathBuf], max_chars: usize) -> LoadedCorpus {
    let mut corpus = LoadedCorpus {
        documents: Vec::new(),
        rejected: 0,
        failures: Vec::new(),
    };

    for path in files {
        let source = relative_path(root, path);
        match load_document(path, max_chars) {
            Ok(text) if text.is_empty() => {
                tracing::info!("Skipping low-quality document: {}", source);
                corpus.rejected += 1;
            }
            Ok(text) => corpus.documents.push(Document { text, source }),
            Err(e) => {
                tracing::warn!("Failed to load {}: {}", source, e);
                corpus.failures.push(e);
            }
        }
    }

    corpus
}

/// 청크 임베딩 (실패한 청크는 기록 후 건너뜀)
async fn embed_chunks(
    embedder: &dyn EmbeddingProvider,
    chunks: &[Chunk],
    report: &mut BuildReport,
) -> Vec<VectorEntry> {
    let mut entries = Vec::with_capacity(chunks.len());
    let dimension = embedder.dimension();

    for (i, chunk) in chunks.iter().enumerate() {
        tracing::debug!("Embedding chunk {}/{}", i + 1, chunks.len());
        let result = embedder.embed(&chunk.content).await.and_then(|embedding| {
            if embedding.len() == dimension {
                Ok(embedding)
            } else {
                Err(anyhow::anyhow!(
                    "dimension mismatch: expected {}, got {}",
                    dimension,
                    embedding.len()
                ))
            }
        });

        match result {
            Ok(embedding) => entries.push(VectorEntry {
                chunk: chunk.clone(),
                embedding,
            }),
            Err(e) => {
                let error = EmbedError {
                    source_path: chunk.source.clone(),
                    chunk_index: chunk.chunk_index,
                    message: format!("{:#}", e),
                };
                tracing::warn!("{}", error);
                report.embed_failures.push(error);
            }
        }
    }

    report.embedded = entries.len();
    entries
}

async fn build_keyword_index(chunks: Vec<Chunk>) -> Result<KeywordIndex> {
    tokio::task::spawn_blocking(move || KeywordIndex::build(&chunks))
        .await
        .context("Keyword index task failed")?
}

fn remove_stale(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Failed to remove stale {:?}: {}", path, e);
        }
    }
}

/// 새 세대 디렉토리 이름 (지문 앞부분 + 빌드 시각, 겹치면 번호 추가)
fn next_generation(vectors_dir: &Path, fingerprint: &str) -> String {
    let base = format!(
        "{}-{}",
        short(fingerprint),
        Utc::now().format("%Y%m%d%H%M%S%3f")
    );
    let mut name = base.clone();
    let mut n = 1;
    while vectors_dir.join(&name).exists() {
        name = format!("{}-{}", base, n);
        n += 1;
    }
    name
}

/// `keep` 이외의 세대 디렉토리 삭제
///
/// 서비스 중인 스냅샷의 세대만 남깁니다. 실패한 빌드가 남긴 디렉토리도 여기서 정리됩니다.
fn prune_generations(vectors_dir: &Path, keep: Option<&str>) {
    let Ok(entries) = std::fs::read_dir(vectors_dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || keep.is_some_and(|k| entry.file_name() == k) {
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => tracing::debug!("Removed old vector generation {:?}", path),
            Err(e) => tracing::warn!("Failed to remove old vector generation {:?}: {}", path, e),
        }
    }
}

fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    pub(crate) const DIM: usize = 8;

    /// 개념 어휘를 고정 차원에 매핑하는 결정적 임베딩
    pub(crate) struct LexiconEmbedder {
        pub calls: AtomicUsize,
        pub fail_on: Option<&'static str>,
    }

    impl LexiconEmbedder {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on: None,
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn lexicon_vector(text: &str) -> Vec<f32> {
        const CONCEPTS: &[(usize, &[&str])] = &[
            (0, &["repeat", "purchase", "재구매", "구매"]),
            (1, &["anomaly", "detection", "이상", "탐지"]),
            (2, &["growth", "성장", "매출"]),
            (3, &["customer", "고객"]),
        ];

        let lower = text.to_lowercase();
        let mut v = vec![0.0f32; DIM];
        for (dim, words) in CONCEPTS {
            for w in *words {
                if lower.contains(w) {
                    v[*dim] += 1.0;
                }
            }
        }
        // 어휘가 없으면 잡음 차원
        if v.iter().all(|x| *x == 0.0) {
            v[DIM - 1] = 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter().map(|x| x / norm).collect()
    }

    #[async_trait]
    impl EmbeddingProvider for LexiconEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Some(marker) = self.fail_on {
                if text.contains(marker) {
                    anyhow::bail!("embedding service rejected chunk");
                }
            }
            Ok(lexicon_vector(text))
        }

        fn dimension(&self) -> usize {
            DIM
        }

        fn name(&self) -> &str {
            "lexicon-test"
        }
    }

    pub(crate) const REPEAT_DOC: &str =
        "Repeat purchase rate is the percentage of customers who buy twice or more.";
    pub(crate) const ANOMALY_DOC: &str =
        "Anomaly detection flags unusual revenue swings using an isolation forest model.";

    pub(crate) fn corpus(files: &[(&str, &str)]) -> (TempDir, RagConfig) {
        let dir = TempDir::new().unwrap();
        let mut config = RagConfig::with_data_dir(dir.path());
        std::fs::create_dir_all(&config.docs_dir).unwrap();
        for (name, content) in files {
            std::fs::write(config.docs_dir.join(name), content).unwrap();
        }
        config.chunk.size = 200;
        config.chunk.overlap = 20;
        (dir, config)
    }

    fn manager(config: RagConfig, embedder: Arc<LexiconEmbedder>) -> IndexManager {
        IndexManager::with_providers(config, Some(embedder), None)
    }

    #[tokio::test]
    async fn test_build_ready_snapshot() {
        let (_dir, config) = corpus(&[("repeat.md", REPEAT_DOC), ("anomaly.txt", ANOMALY_DOC)]);
        let embedder = Arc::new(LexiconEmbedder::new());
        let m = manager(config.clone(), embedder.clone());

        let snap = m.build_or_load(false).await;
        assert!(snap.is_ready());
        assert_eq!(snap.files_count, 2);
        assert_eq!(snap.chunks_count, 2);
        assert!(snap.last_error.is_none());
        assert_eq!(embedder.calls(), 2);

        let state = StateFile::load(&config.state_file()).unwrap();
        assert_eq!(Some(state.fingerprint.as_str()), snap.fingerprint.as_deref());
        assert!(state.keyword_ready);
        assert!(!state.graph_ready);
    }

    #[tokio::test]
    async fn test_reuses_disk_index_without_embedding() {
        let (_dir, config) = corpus(&[("repeat.md", REPEAT_DOC)]);
        let first = Arc::new(LexiconEmbedder::new());
        manager(config.clone(), first.clone()).build_or_load(false).await;
        assert_eq!(first.calls(), 1);

        // 새 프로세스를 흉내낸 새 관리자
        let second = Arc::new(LexiconEmbedder::new());
        let m = manager(config, second.clone());
        let snap = m.build_or_load(false).await;

        assert!(snap.is_ready());
        assert_eq!(second.calls(), 0);
        assert_eq!(m.full_build_count(), 0);
        assert!(m.last_report().unwrap().reused_cache);
    }

    #[tokio::test]
    async fn test_changed_corpus_invalidates_cache() {
        let (_dir, config) = corpus(&[("repeat.md", REPEAT_DOC)]);
        let embedder = Arc::new(LexiconEmbedder::new());
        let m = manager(config.clone(), embedder.clone());
        let before = m.build_or_load(false).await;

        std::fs::write(config.docs_dir.join("repeat.md"), format!("{} Updated.", REPEAT_DOC)).unwrap();
        let after = m.build_or_load(false).await;

        assert_ne!(before.fingerprint, after.fingerprint);
        assert_eq!(m.full_build_count(), 2);
        assert_eq!(embedder.calls(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_corpus_keeps_snapshot() {
        let (_dir, config) = corpus(&[("repeat.md", REPEAT_DOC)]);
        let m = manager(config, Arc::new(LexiconEmbedder::new()));
        let a = m.build_or_load(false).await;
        let b = m.build_or_load(false).await;
        assert!(Arc::ptr_eq(&a, &b));

        let c = m.build_or_load(true).await;
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(m.full_build_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_corpus_is_empty_not_failed() {
        let (_dir, config) = corpus(&[("tiny.txt", "x")]);
        let m = manager(config.clone(), Arc::new(LexiconEmbedder::new()));
        let snap = m.build_or_load(false).await;

        assert_eq!(snap.status, IndexStatus::Empty);
        assert!(!snap.is_ready());
        assert!(snap.last_error.as_deref().unwrap().contains("No usable documents"));
        assert_eq!(m.last_report().unwrap().documents_rejected, 1);
        assert!(StateFile::load(&config.state_file()).unwrap().error.is_some());
    }

    #[tokio::test]
    async fn test_missing_directory_fails() {
        let (_dir, mut config) = corpus(&[]);
        config.docs_dir = config.docs_dir.join("missing");
        let m = manager(config, Arc::new(LexiconEmbedder::new()));
        let snap = m.build_or_load(false).await;

        assert_eq!(snap.status, IndexStatus::Failed);
        assert!(snap.last_error.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_no_embedder_fails() {
        let (_dir, config) = corpus(&[("repeat.md", REPEAT_DOC)]);
        let m = IndexManager::new(config);
        let snap = m.build_or_load(false).await;

        assert_eq!(snap.status, IndexStatus::Failed);
        assert!(snap.last_error.as_deref().unwrap().contains("Embeddings unavailable"));
    }

    #[tokio::test]
    async fn test_embed_failures_are_skipped_and_counted() {
        let (_dir, config) = corpus(&[("repeat.md", REPEAT_DOC), ("anomaly.txt", ANOMALY_DOC)]);
        let embedder = Arc::new(LexiconEmbedder {
            calls: AtomicUsize::new(0),
            fail_on: Some("isolation"),
        });
        let m = manager(config, embedder);
        let snap = m.build_or_load(false).await;

        assert!(snap.is_ready());
        let report = m.last_report().unwrap();
        assert_eq!(report.embedded, 1);
        assert_eq!(report.embed_failures.len(), 1);
        assert_eq!(report.embed_failures[0].source_path, "anomaly.txt");
        // 키워드 인덱스는 모든 청크를 포함
        assert_eq!(snap.keyword.as_ref().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_all_embeddings_failing_is_failure() {
        let (_dir, config) = corpus(&[("repeat.md", REPEAT_DOC)]);
        let embedder = Arc::new(LexiconEmbedder {
            calls: AtomicUsize::new(0),
            fail_on: Some("Repeat"),
        });
        let snap = manager(config, embedder).build_or_load(false).await;

        assert_eq!(snap.status, IndexStatus::Failed);
        assert!(snap.last_error.as_deref().unwrap().starts_with("Embeddings unavailable"));
    }

    #[tokio::test]
    async fn test_concurrent_builds_share_one_run() {
        let (_dir, config) = corpus(&[("repeat.md", REPEAT_DOC), ("anomaly.txt", ANOMALY_DOC)]);
        let embedder = Arc::new(LexiconEmbedder::new());
        let m = manager(config, embedder.clone());

        let (a, b) = tokio::join!(m.build_or_load(false), m.build_or_load(false));

        assert_eq!(m.full_build_count(), 1);
        assert_eq!(embedder.calls(), 2);
        assert!(Arc::ptr_eq(&a, &b));
    }

    /// 모든 청크에서 엔티티 하나를 돌려주는 추출기
    struct SingleEntity;

    #[async_trait]
    impl CompletionProvider for SingleEntity {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok(r#"{"entities": [{"id": "repeat_rate", "name": "Repeat purchase rate", "type": "METRIC"}], "relations": []}"#.to_string())
        }

        fn model_name(&self) -> &str {
            "single-entity"
        }
    }

    #[tokio::test]
    async fn test_rebuild_keeps_served_table_readable() {
        let (_dir, config) = corpus(&[("repeat.md", REPEAT_DOC)]);
        let m = manager(config.clone(), Arc::new(LexiconEmbedder::new()));
        let first = m.build_or_load(false).await;
        let first_gen = first.generation.clone().unwrap();

        std::fs::write(config.docs_dir.join("anomaly.txt"), ANOMALY_DOC).unwrap();
        let second = m.build_or_load(false).await;
        let second_gen = second.generation.clone().unwrap();
        assert_ne!(first_gen, second_gen);

        // 교체된 스냅샷을 들고 있는 쿼리는 이전 테이블을 계속 읽음
        let hits = first
            .vector
            .as_ref()
            .unwrap()
            .search(&lexicon_vector("repeat purchase"), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.source, "repeat.md");
        assert!(config.vectors_dir().join(&first_gen).exists());

        // 다음 재빌드는 서비스 중이 아닌 세대만 정리
        let third = m.build_or_load(true).await;
        assert!(!config.vectors_dir().join(&first_gen).exists());
        assert!(config.vectors_dir().join(&second_gen).exists());
        assert!(config
            .vectors_dir()
            .join(third.generation.as_deref().unwrap())
            .exists());
    }

    #[tokio::test]
    async fn test_failed_rebuild_leaves_previous_table_intact() {
        let (_dir, config) = corpus(&[("repeat.md", REPEAT_DOC)]);
        let m = manager(config.clone(), Arc::new(LexiconEmbedder::new()));
        let first = m.build_or_load(false).await;
        let first_gen = first.generation.clone().unwrap();

        m.set_embedder(Arc::new(LexiconEmbedder {
            calls: AtomicUsize::new(0),
            fail_on: Some("Repeat"),
        }));
        let failed = m.build_or_load(true).await;

        assert_eq!(failed.status, IndexStatus::Failed);
        assert!(config.vectors_dir().join(&first_gen).exists());
        let hits = first
            .vector
            .as_ref()
            .unwrap()
            .search(&lexicon_vector("repeat"), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_set_completer_adds_graph_on_rebuild() {
        let (_dir, config) = corpus(&[("repeat.md", REPEAT_DOC)]);
        let m = manager(config.clone(), Arc::new(LexiconEmbedder::new()));
        assert!(!m.build_or_load(false).await.graph.is_ready());

        m.set_completer(Arc::new(SingleEntity));
        let snap = m.build_or_load(true).await;

        assert!(snap.graph.is_ready());
        assert_eq!(snap.graph.entities()[0].id, "repeat_rate");
        assert!(StateFile::load(&config.state_file()).unwrap().graph_ready);
    }

    #[tokio::test]
    async fn test_ensure_ready_builds_on_demand() {
        let (_dir, config) = corpus(&[("repeat.md", REPEAT_DOC)]);
        let m = manager(config, Arc::new(LexiconEmbedder::new()));
        assert_eq!(m.snapshot().status, IndexStatus::NotBuilt);

        let snap = m.ensure_ready().await;
        assert!(snap.is_ready());
        let again = m.ensure_ready().await;
        assert!(Arc::ptr_eq(&snap, &again));
    }
}
