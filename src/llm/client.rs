use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::config::RetryConfig;
use crate::error::{FiscalAuditError, Result};
use crate::llm::CompletionClient;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// HTTP-backed [`CompletionClient`] speaking the generateContent protocol.
/// Requests JSON output, optionally constrained by a response schema, and
/// retries transient failures with exponential backoff plus jitter.
#[derive(Clone)]
pub struct HttpCompletionClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    response_schema: Option<serde_json::Value>,
    retry: RetryConfig,
}

impl HttpCompletionClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            response_schema: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Constrains every response to the given JSON schema.
    pub fn with_response_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn request_once(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let payload = GenerateContentRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![Part {
                    text: user_prompt.to_string(),
                }],
            }],
            system_instruction: Some(Content {
                role: "user".to_string(),
                parts: vec![Part {
                    text: system_prompt.to_string(),
                }],
            }),
            generation_config: GenerationConfig {
                response_mime_type: "application/json".to_string(),
                response_schema: self.response_schema.clone(),
            },
        };

        let res = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| FiscalAuditError::Completion(format!("request failed: {}", e)))?;

        let status = res.status();
        if !status.is_success() {
            let err_text = res
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(FiscalAuditError::Completion(format!(
                "API error (status {}): {}",
                status, err_text
            )));
        }

        let body: GenerateContentResponse = res
            .json()
            .await
            .map_err(|e| FiscalAuditError::Completion(format!("unreadable response: {}", e)))?;

        body.candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content.parts.into_iter().next())
            .and_then(|part| part.text)
            .ok_or_else(|| {
                FiscalAuditError::Completion("no text candidate in response".to_string())
            })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let mut last_error = FiscalAuditError::Completion("no attempts made".to_string());
        for attempt in 1..=self.retry.max_attempts.max(1) {
            match self.request_once(system_prompt, user_prompt).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    warn!(
                        "completion attempt {}/{} failed: {}",
                        attempt, self.retry.max_attempts, e
                    );
                    last_error = e;
                }
            }
            if attempt < self.retry.max_attempts {
                let jitter = rand::thread_rng().gen_range(0..=self.retry.max_jitter_ms);
                let backoff = self.retry.base_delay_ms * 2u64.pow(attempt.saturating_sub(1));
                sleep(Duration::from_millis(backoff + jitter)).await;
            }
        }
        Err(last_error)
    }
}

/// Strips a Markdown code fence from a model answer, if present. Models
/// sometimes wrap JSON in ```json fences even when asked not to.
pub fn clean_json_block(text: &str) -> &str {
    let trimmed = text.trim();
    let opened = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    opened.strip_suffix("```").unwrap_or(opened).trim()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}
