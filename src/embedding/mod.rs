//! 임베딩 모듈 - Gemini API를 통한 텍스트 벡터화
//!
//! 문서 청크는 `RETRIEVAL_DOCUMENT`, 검색 쿼리는 `RETRIEVAL_QUERY` 작업 유형으로
//! 임베딩합니다. 모델 id와 차원은 설정에서 받습니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = GeminiEmbedding::from_env(&config.embedding)?;
//! let embedding = embedder.embed_query("재구매율").await?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::EmbeddingSettings;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 문서 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 검색 쿼리 임베딩 (기본 구현: `embed`와 동일)
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embed(query).await
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 모델 식별자 (사이드카 상태 파일에 기록)
    fn name(&self) -> &str;
}

// ============================================================================
// Google Gemini Embedding
// ============================================================================

/// Gemini API 베이스 URL
/// source: https://ai.google.dev/gemini-api/docs/embeddings
pub(crate) const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Rate Limiter 설정 (Gemini 무료 티어: 60 RPM)
const RATE_LIMIT_RPM: u32 = 60;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
/// 호출 간 최소 딜레이 (1000ms = 60 RPM 준수)
const MIN_DELAY_MS: u64 = 1000;
/// 429/전송 에러 시 최대 재시도 횟수
pub(crate) const MAX_RETRIES: u32 = 3;
/// 재시도 시 초기 백오프 (ms)
pub(crate) const INITIAL_BACKOFF_MS: u64 = 2000;

/// 임베딩 작업 유형
#[derive(Debug, Clone, Copy)]
enum TaskType {
    Document,
    Query,
}

impl TaskType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "RETRIEVAL_DOCUMENT",
            Self::Query => "RETRIEVAL_QUERY",
        }
    }
}

/// Google Gemini 임베딩 구현체
#[derive(Debug)]
pub struct GeminiEmbedding {
    api_key: String,
    model: String,
    client: reqwest::Client,
    dimension: usize,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

/// 요청 간 최소 간격 + 윈도우당 요청 수 제한
#[derive(Debug)]
pub(crate) struct RateLimiter {
    requests: Vec<Instant>,
    max_requests: u32,
    window: Duration,
    min_delay: Duration,
    last_request: Option<Instant>,
}

impl RateLimiter {
    pub(crate) fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            requests: Vec::new(),
            max_requests,
            window,
            min_delay: Duration::from_millis(MIN_DELAY_MS),
            last_request: None,
        }
    }

    /// Gemini 무료 티어 기본값
    pub(crate) fn gemini_free_tier() -> Self {
        Self::new(RATE_LIMIT_RPM, RATE_LIMIT_WINDOW)
    }

    /// 요청 가능할 때까지 대기
    pub(crate) async fn acquire(&mut self) {
        // 1. 최소 딜레이 (버스트 방지)
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                let wait_time = self.min_delay - elapsed;
                tracing::debug!("Min delay: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        let now = Instant::now();
        self.requests.retain(|&t| now.duration_since(t) < self.window);

        // 2. 윈도우 한도 초과 시 가장 오래된 요청이 빠질 때까지 대기
        if self.requests.len() >= self.max_requests as usize {
            if let Some(&oldest) = self.requests.first() {
                let wait_time = self.window.saturating_sub(now.duration_since(oldest));
                if !wait_time.is_zero() {
                    tracing::debug!("Rate limit reached, waiting {:?}", wait_time);
                    tokio::time::sleep(wait_time).await;
                }
                let now = Instant::now();
                self.requests.retain(|&t| now.duration_since(t) < self.window);
            }
        }

        let now = Instant::now();
        self.requests.push(now);
        self.last_request = Some(now);
    }
}

impl GeminiEmbedding {
    /// 새 Gemini 임베딩 인스턴스 생성
    ///
    /// # Arguments
    /// * `api_key` - Google AI API 키
    /// * `settings` - 모델 id, 차원 (768, 1536, 3072 중 선택)
    pub fn new(api_key: String, settings: &EmbeddingSettings) -> Result<Self> {
        if ![768, 1536, 3072].contains(&settings.dimension) {
            anyhow::bail!(
                "Invalid dimension: {}. Must be 768, 1536, or 3072",
                settings.dimension
            );
        }
        if settings.model.trim().is_empty() {
            anyhow::bail!("Embedding model id is empty");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            model: settings.model.trim().to_string(),
            client,
            dimension: settings.dimension,
            rate_limiter: Arc::new(Mutex::new(RateLimiter::gemini_free_tier())),
        })
    }

    /// 환경변수에서 API 키를 읽어 생성
    pub fn from_env(settings: &EmbeddingSettings) -> Result<Self> {
        Self::new(get_api_key()?, settings)
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:embedContent", GEMINI_API_BASE, self.model)
    }

    async fn embed_with_task(&self, text: &str, task: TaskType) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        let request = EmbedRequest {
            model: format!("models/{}", self.model),
            content: EmbedContent {
                parts: vec![EmbedPart {
                    text: text.to_string(),
                }],
            },
            task_type: task.as_str().to_string(),
            output_dimensionality: Some(self.dimension),
        };

        let url = self.endpoint();
        let mut last_error: Option<anyhow::Error> = None;

        // 429/전송 에러는 지수 백오프로 재시도
        for attempt in 0..=MAX_RETRIES {
            {
                let mut limiter = self.rate_limiter.lock().await;
                limiter.acquire().await;
            }

            // API 키는 URL이 아닌 헤더로 전송
            let response = match self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&request)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(anyhow::anyhow!("Failed to send embedding request: {}", e));
                    if attempt < MAX_RETRIES {
                        let backoff = backoff_for(attempt);
                        tracing::warn!(
                            "Embedding request failed, retrying in {:?} (attempt {}/{})",
                            backoff,
                            attempt + 1,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    break;
                }
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .context("Failed to read response body")?;

            if status.is_success() {
                let parsed: EmbedResponse =
                    serde_json::from_str(&body).context("Failed to parse embedding response")?;
                if parsed.embedding.values.len() != self.dimension {
                    anyhow::bail!(
                        "Embedding dimension mismatch: expected {}, got {}",
                        self.dimension,
                        parsed.embedding.values.len()
                    );
                }
                return Ok(parsed.embedding.values);
            }

            if status.as_u16() == 429 {
                let backoff = backoff_for(attempt);
                tracing::warn!(
                    "Rate limit hit (429), backing off {:?} (attempt {}/{})",
                    backoff,
                    attempt + 1,
                    MAX_RETRIES
                );
                last_error = Some(anyhow::anyhow!("Rate limit exceeded (429)"));
                if attempt < MAX_RETRIES {
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            } else {
                return Err(api_error(status, &body));
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("Embedding failed after {} retries", MAX_RETRIES)))
    }
}

/// 재시도 백오프 시간
pub(crate) fn backoff_for(attempt: u32) -> Duration {
    Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt))
}

/// Gemini 에러 응답을 anyhow 에러로 변환
pub(crate) fn api_error(status: reqwest::StatusCode, body: &str) -> anyhow::Error {
    match serde_json::from_str::<GeminiError>(body) {
        Ok(error) => anyhow::anyhow!(
            "Gemini API error ({}): {}",
            error.error.status,
            error.error.message
        ),
        Err(_) => anyhow::anyhow!("Gemini API error ({}): {}", status, body),
    }
}

/// Gemini API 요청 본문
/// source: https://ai.google.dev/gemini-api/docs/embeddings
#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: EmbedContent,
    #[serde(rename = "taskType")]
    task_type: String,
    #[serde(rename = "outputDimensionality", skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

/// Gemini API 에러 응답
#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
    #[serde(default)]
    status: String,
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_with_task(text, TaskType::Document).await
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        self.embed_with_task(query, TaskType::Query).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// API Key Management
// ============================================================================

/// API 키 로드 (환경변수에서)
///
/// 우선순위:
/// 1. `GEMINI_API_KEY` 환경변수
/// 2. `GOOGLE_AI_API_KEY` 환경변수
pub fn get_api_key() -> Result<String> {
    for var in ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"] {
        if let Ok(key) = std::env::var(var) {
            if !key.trim().is_empty() {
                tracing::debug!("Using API key from {}", var);
                return Ok(key.trim().to_string());
            }
        }
    }

    anyhow::bail!(
        "API key not found. Set GEMINI_API_KEY or GOOGLE_AI_API_KEY environment variable.\n\
         Get your API key at: https://aistudio.google.com/app/apikey"
    )
}

/// 요청별 키가 있으면 그것을, 없으면 환경변수 키 사용
pub fn resolve_api_key(override_key: Option<&str>) -> Result<String> {
    match override_key.map(str::trim).filter(|k| !k.is_empty()) {
        Some(key) => Ok(key.to_string()),
        None => get_api_key(),
    }
}

/// API 키 존재 여부 확인
pub fn has_api_key() -> bool {
    get_api_key().is_ok()
}

// ============================================================================
// Factory Function
// ============================================================================

/// 임베딩 프로바이더 생성 (Gemini API)
pub fn create_embedder(
    settings: &EmbeddingSettings,
    api_key: Option<&str>,
) -> Result<GeminiEmbedding> {
    let key = resolve_api_key(api_key).context(
        "GEMINI_API_KEY or GOOGLE_AI_API_KEY not set.\n\
         Set: export GEMINI_API_KEY=your-api-key",
    )?;

    let embedder = GeminiEmbedding::new(key, settings)?;
    tracing::info!(
        "Using Gemini embedding {} (dimension: {})",
        embedder.name(),
        embedder.dimension()
    );
    Ok(embedder)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dimension: usize) -> EmbeddingSettings {
        EmbeddingSettings {
            model: "gemini-embedding-001".to_string(),
            dimension,
        }
    }

    #[test]
    fn test_invalid_dimension() {
        let result = GeminiEmbedding::new("fake_key".to_string(), &settings(999));
        let err = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("Invalid dimension"));
    }

    #[test]
    fn test_valid_dimensions_and_endpoint() {
        for dim in [768, 1536, 3072] {
            let embedder = GeminiEmbedding::new("fake_key".to_string(), &settings(dim)).unwrap();
            assert_eq!(embedder.dimension(), dim);
            assert_eq!(embedder.name(), "gemini-embedding-001");
            assert!(embedder.endpoint().ends_with("/models/gemini-embedding-001:embedContent"));
        }
    }

    #[test]
    fn test_resolve_api_key_override() {
        assert_eq!(resolve_api_key(Some("  abc ")).unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_empty_text_returns_zero_vector() {
        let embedder = GeminiEmbedding::new("fake_key".to_string(), &settings(768)).unwrap();
        let v = embedder.embed_query("   ").await.unwrap();
        assert_eq!(v.len(), 768);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_api_error_message() {
        let body = r#"{"error":{"message":"API key not valid","status":"INVALID_ARGUMENT"}}"#;
        let err = api_error(reqwest::StatusCode::BAD_REQUEST, body);
        assert!(err.to_string().contains("INVALID_ARGUMENT"));

        let err = api_error(reqwest::StatusCode::BAD_GATEWAY, "upstream");
        assert!(err.to_string().contains("upstream"));
    }

    #[test]
    fn test_backoff_grows() {
        assert!(backoff_for(1) > backoff_for(0));
    }
}
