//! OpenRouter inference client
//!
//! Async HTTP client for an OpenRouter-compatible API providing:
//! - Embeddings via `/embeddings`
//! - Entity/fact extraction via `/chat/completions` with JSON output
//! - Classification of every failure into a [`ProviderErrorKind`]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use reqwest::header::RETRY_AFTER;
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{Error, ProviderError, ProviderErrorKind, Result};

use super::provider::InferenceProvider;
use super::types::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, ExtractedGraph, Message};

/// Retry-after assumed for a 429 that carries no hint
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

const EXTRACTION_PROMPT: &str = "Extract the entities and the facts relating them from the user's text. \
Respond with a JSON object of the form \
{\"entities\": [{\"name\": string, \"summary\": string}], \
\"facts\": [{\"source\": string, \"target\": string, \"relation\": string, \"fact\": string}]}. \
Every fact's source and target must name an entity in the entities list. \
Relations are short snake_case verbs such as works_at or depends_on.";

/// Inference client for an OpenRouter-compatible API
#[derive(Clone)]
pub struct LlmClient {
    http_client: HttpClient,
    config: LlmConfig,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("base_url", &self.base_url)
            .field("extraction_model", &self.config.extraction_model)
            .field("embedding_model", &self.config.embedding_model)
            .finish()
    }
}

/// Builder for creating an LlmClient
#[derive(Default)]
pub struct LlmClientBuilder {
    config: Option<LlmConfig>,
    api_key: Option<String>,
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

impl LlmClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: LlmConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the base URL (defaults to the configured one)
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the per-request timeout
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn build(self) -> Result<LlmClient> {
        let config = self.config.unwrap_or_default();
        let api_key = self
            .api_key
            .ok_or_else(|| Error::ConfigError("Inference API key is required".to_string()))?;

        let timeout_secs = self.timeout_secs.unwrap_or(config.timeout_secs);

        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        let base_url = self
            .base_url
            .unwrap_or_else(|| config.base_url.clone())
            .trim_end_matches('/')
            .to_string();

        Ok(LlmClient {
            http_client,
            config,
            api_key,
            base_url,
        })
    }
}

impl LlmClient {
    pub fn builder() -> LlmClientBuilder {
        LlmClientBuilder::new()
    }

    /// Build a client from configuration, reading the key from the environment
    pub fn from_config(config: LlmConfig) -> Result<Self> {
        let api_key = config
            .resolved_api_key()
            .map_err(|e| Error::ConfigError(e.to_string()))?
            .ok_or_else(|| {
                Error::ConfigError("Set TEMPOGRAPH_API_KEY or OPENROUTER_API_KEY".to_string())
            })?;

        LlmClientBuilder::new().config(config).api_key(api_key).build()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> std::result::Result<reqwest::Response, ProviderError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Title", "Tempograph")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        Err(classify_status(status.as_u16(), &body, retry_after))
    }
}

#[async_trait]
impl InferenceProvider for LlmClient {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
        let request = EmbeddingRequest::new(&self.config.embedding_model, text);
        debug!(model = %request.model, chars = text.len(), "Sending embedding request");

        let response: EmbeddingResponse = self.post("/embeddings", &request).await?.json().await?;

        response
            .data
            .into_iter()
            .min_by_key(|d| d.index)
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ProviderError::unknown("Empty embedding response"))
    }

    async fn extract_entities(&self, text: &str) -> std::result::Result<ExtractedGraph, ProviderError> {
        let request = ChatRequest::new(
            &self.config.extraction_model,
            vec![Message::system(EXTRACTION_PROMPT), Message::user(text)],
        )
        .with_temperature(0.0)
        .with_json_output();
        debug!(model = %request.model, chars = text.len(), "Sending extraction request");

        let response: ChatResponse = self.post("/chat/completions", &request).await?.json().await?;
        let content = response
            .content()
            .ok_or_else(|| ProviderError::unknown("Empty response from API"))?;

        parse_extraction(content)
    }
}

/// Map a non-success HTTP status onto the provider error taxonomy
pub(crate) fn classify_status(status: u16, body: &str, retry_after: Option<Duration>) -> ProviderError {
    match status {
        401 | 403 => ProviderError::auth(format!(
            "Unauthorized ({}): Invalid API key. Set TEMPOGRAPH_API_KEY or OPENROUTER_API_KEY.",
            status
        )),
        402 => ProviderError::quota("Payment required: insufficient credits on provider account"),
        429 if body.contains("insufficient_quota") => {
            ProviderError::quota(format!("Quota exceeded: {}", body))
        }
        429 => {
            let wait = retry_after
                .or_else(|| extract_retry_after(body))
                .unwrap_or(DEFAULT_RATE_LIMIT_WAIT);
            ProviderError::rate_limited(wait)
        }
        408 | 500..=599 => ProviderError {
            retry_after,
            ..ProviderError::network(format!("Server error ({}): {}", status, body))
        },
        _ => ProviderError::new(
            ProviderErrorKind::Unknown,
            format!("HTTP error {}: {}", status, body),
        ),
    }
}

/// Extract a retry-after value (seconds) from an error response body
fn extract_retry_after(body: &str) -> Option<Duration> {
    let json = serde_json::from_str::<serde_json::Value>(body).ok()?;
    json.get("retry_after")
        .or_else(|| json.get("error").and_then(|e| e.get("retry_after")))
        .and_then(|v| v.as_u64())
        .map(Duration::from_secs)
}

/// Parse the extraction model's output, tolerating a markdown code fence
pub(crate) fn parse_extraction(content: &str) -> std::result::Result<ExtractedGraph, ProviderError> {
    let trimmed = content.trim();
    let json = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(json)
        .map_err(|e| ProviderError::unknown(format!("Malformed extraction output: {}", e)))
}
