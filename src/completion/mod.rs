//! 완성(Completion) 모듈 - 엔티티/관계 추출용 Gemini 텍스트 생성
//!
//! 그래프 빌더만 사용합니다. 응답 파싱은 호출 측(`graph::builder`)이 담당합니다.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::CompletionSettings;
use crate::embedding::{
    api_error, backoff_for, resolve_api_key, RateLimiter, GEMINI_API_BASE, MAX_RETRIES,
};

/// 추출은 결정적인 응답이 필요하므로 낮은 temperature 사용
const TEMPERATURE: f32 = 0.1;
const MAX_OUTPUT_TOKENS: u32 = 2000;

const SYSTEM_INSTRUCTION: &str =
    "You extract entities and relations from text and answer with JSON only.";

// ============================================================================
// CompletionProvider Trait
// ============================================================================

/// 텍스트 완성 프로바이더
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// 프롬프트에 대한 응답 텍스트
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// 모델 식별자
    fn model_name(&self) -> &str;
}

// ============================================================================
// Gemini Completion
// ============================================================================

/// Gemini generateContent 구현체
/// source: https://ai.google.dev/api/generate-content
#[derive(Debug)]
pub struct GeminiCompletion {
    api_key: String,
    model: String,
    client: reqwest::Client,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl GeminiCompletion {
    pub fn new(api_key: String, settings: &CompletionSettings) -> Result<Self> {
        if settings.model.trim().is_empty() {
            anyhow::bail!("Completion model id is empty");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            model: settings.model.trim().to_string(),
            client,
            rate_limiter: Arc::new(Mutex::new(RateLimiter::gemini_free_tier())),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", GEMINI_API_BASE, self.model)
    }

    fn request_body(prompt: &str) -> GenerateRequest {
        GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part {
                    text: SYSTEM_INSTRUCTION.to_string(),
                }],
            },
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                max_output_tokens: MAX_OUTPUT_TOKENS,
            },
        }
    }
}

/// 첫 후보의 텍스트 파트를 이어 붙임
fn response_text(body: &str) -> Result<String> {
    let parsed: GenerateResponse =
        serde_json::from_str(body).context("Failed to parse completion response")?;

    let text = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| {
            c.parts
                .into_iter()
                .map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    Ok(text.trim().to_string())
}

#[async_trait]
impl CompletionProvider for GeminiCompletion {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = Self::request_body(prompt);
        let url = self.endpoint();
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=MAX_RETRIES {
            {
                let mut limiter = self.rate_limiter.lock().await;
                limiter.acquire().await;
            }

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
                    last_error = Some(anyhow::anyhow!("Failed to send completion request: {}", e));
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(backoff_for(attempt)).await;
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
                return response_text(&body);
            }

            if status.as_u16() == 429 {
                last_error = Some(anyhow::anyhow!("Rate limit exceeded (429)"));
                if attempt < MAX_RETRIES {
                    let backoff = backoff_for(attempt);
                    tracing::warn!("Rate limit hit (429), backing off {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            } else {
                return Err(api_error(status, &body));
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("Completion failed after {} retries", MAX_RETRIES)))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// 완성 프로바이더 생성 (API 키가 없으면 에러)
pub fn create_completer(
    settings: &CompletionSettings,
    api_key: Option<&str>,
) -> Result<GeminiCompletion> {
    let key = resolve_api_key(api_key)?;
    GeminiCompletion::new(key, settings)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_value(GeminiCompletion::request_body("hello")).unwrap();
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2000);
        assert!(body["systemInstruction"].get("role").is_none());
    }

    #[test]
    fn test_response_text_joins_parts() {
        let body = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":" {\"entities\""},{"text":":[]} "}]}}]}"#;
        assert_eq!(response_text(body).unwrap(), "{\"entities\":[]}");
    }

    #[test]
    fn test_response_text_without_candidates() {
        assert_eq!(response_text(r#"{"candidates":[]}"#).unwrap(), "");
        assert!(response_text("oops").is_err());
    }

    #[test]
    fn test_endpoint_uses_model() {
        let c = GeminiCompletion::new(
            "k".to_string(),
            &CompletionSettings {
                model: "gemini-2.0-flash".to_string(),
            },
        )
        .unwrap();
        assert!(c.endpoint().ends_with("/models/gemini-2.0-flash:generateContent"));
        assert_eq!(c.model_name(), "gemini-2.0-flash");
    }
}
