//! LM client trait and provider implementations.
//!
//! Both clients speak plain chat-completion HTTP. Transient failures
//! (network errors, 429, 5xx) are marked retryable so the agent loop can back
//! off and retry within the same node.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::types::{ChatRole, CompletionRequest, CompletionResponse, Provider, TokenUsage};

/// LM client: chat-style completions returning text plus token counts.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Complete a prompt.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Get the provider for this client.
    fn provider(&self) -> Provider;
}

/// Configuration for LM clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API key
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Default model
    pub default_model: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            default_model: None,
            timeout_secs: 120,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Client {
    let timeout = Duration::from_secs(timeout_secs);

    // Some sandboxed macOS environments can panic during proxy auto-detection
    // in reqwest's default client builder. Fall back to no-proxy in that case.
    match catch_unwind(AssertUnwindSafe(|| {
        Client::builder().timeout(timeout).build()
    })) {
        Ok(Ok(client)) => client,
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client"),
    }
}

fn status_is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Anthropic-compatible client.
pub struct AnthropicClient {
    config: ClientConfig,
    http: Client,
}

impl AnthropicClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

// Anthropic API types
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    model: String,
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[async_trait]
impl LLMClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .or(self.config.default_model.clone())
            .unwrap_or_else(|| crate::config::DEFAULT_MODEL.to_string());

        let messages: Vec<AnthropicMessage> = request
            .messages
            .iter()
            .map(|m| AnthropicMessage {
                role: match m.role {
                    ChatRole::User => "user".to_string(),
                    ChatRole::Assistant => "assistant".to_string(),
                    ChatRole::System => "user".to_string(), // System handled separately
                },
                content: m.content.clone(),
            })
            .collect();

        let api_request = AnthropicRequest {
            model: model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(4096),
            system: request.system,
            temperature: request.temperature,
        };

        let url = format!("{}/v1/messages", self.base_url());
        debug!(%model, "sending anthropic completion request");

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::provider("anthropic", format!("HTTP request failed: {}", e), true))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::provider("anthropic", format!("failed to read response: {}", e), true))?;

        if !status.is_success() {
            let retryable = status_is_transient(status);
            if let Ok(error) = serde_json::from_str::<AnthropicError>(&body) {
                return Err(Error::provider(
                    "anthropic",
                    format!("{} ({})", error.error.message, error.error.error_type),
                    retryable,
                ));
            }
            return Err(Error::provider(
                "anthropic",
                format!("status {}: {}", status, body),
                retryable,
            ));
        }

        let api_response: AnthropicResponse = serde_json::from_str(&body)
            .map_err(|e| Error::provider("anthropic", format!("failed to parse response: {}", e), false))?;

        let content = api_response
            .content
            .iter()
            .filter_map(|c| c.text.as_ref())
            .cloned()
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content,
            usage: TokenUsage::new(
                api_response.usage.input_tokens,
                api_response.usage.output_tokens,
            ),
            timestamp: Utc::now(),
        })
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }
}

/// OpenAI-compatible client.
pub struct OpenAIClient {
    config: ClientConfig,
    http: Client,
}

impl OpenAIClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

// OpenAI API types
#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    id: String,
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: OpenAIUsage,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    error: OpenAIErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorDetail {
    message: String,
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .or(self.config.default_model.clone())
            .unwrap_or_else(|| "gpt-4o".to_string());

        let mut messages: Vec<OpenAIMessage> = Vec::new();

        if let Some(system) = &request.system {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }

        for m in &request.messages {
            messages.push(OpenAIMessage {
                role: match m.role {
                    ChatRole::User => "user".to_string(),
                    ChatRole::Assistant => "assistant".to_string(),
                    ChatRole::System => "system".to_string(),
                },
                content: m.content.clone(),
            });
        }

        let api_request = OpenAIRequest {
            model: model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let url = format!("{}/v1/chat/completions", self.base_url());
        debug!(%model, "sending openai completion request");

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::provider("openai", format!("HTTP request failed: {}", e), true))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::provider("openai", format!("failed to read response: {}", e), true))?;

        if !status.is_success() {
            let retryable = status_is_transient(status);
            if let Ok(error) = serde_json::from_str::<OpenAIError>(&body) {
                return Err(Error::provider("openai", error.error.message, retryable));
            }
            return Err(Error::provider(
                "openai",
                format!("status {}: {}", status, body),
                retryable,
            ));
        }

        let api_response: OpenAIResponse = serde_json::from_str(&body)
            .map_err(|e| Error::provider("openai", format!("failed to parse response: {}", e), false))?;

        let choice = api_response
            .choices
            .first()
            .ok_or_else(|| Error::provider("openai", "no choices in response", false))?;

        Ok(CompletionResponse {
            id: api_response.id,
            model: api_response.model,
            content: choice.message.content.clone(),
            usage: TokenUsage::new(
                api_response.usage.prompt_tokens,
                api_response.usage.completion_tokens,
            ),
            timestamp: Utc::now(),
        })
    }

    fn provider(&self) -> Provider {
        Provider::OpenAI
    }
}

/// Total attempts for one LM call, including the first.
pub const MAX_ATTEMPTS: u32 = 3;
/// Base backoff before the first retry.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Backoff before retry `attempt` (1-based): base * 2^(attempt-1), ±25% jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE.as_millis() as u64 * 2u64.pow(attempt.saturating_sub(1));
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((base as f64 * jitter) as u64)
}

/// Complete with retries on transient provider errors.
///
/// Retries are confined to one call: they never create additional nodes. The
/// whole loop is bounded by `deadline`.
pub async fn complete_with_retry(
    client: &dyn LLMClient,
    request: CompletionRequest,
    deadline: &crate::deadline::Deadline,
    per_call_cap: Duration,
) -> Result<CompletionResponse> {
    let mut attempt = 0;
    loop {
        attempt += 1;

        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Err(Error::DeadlineExceeded);
        }

        let call_timeout = remaining.min(per_call_cap);
        let result = tokio::time::timeout(call_timeout, client.complete(request.clone())).await;

        let err = match result {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(err)) => err,
            Err(_elapsed) => {
                if deadline.expired() {
                    return Err(Error::DeadlineExceeded);
                }
                Error::provider(
                    client.provider().to_string(),
                    format!("request exceeded {}s cap", call_timeout.as_secs()),
                    true,
                )
            }
        };

        if !err.is_retryable() || attempt >= MAX_ATTEMPTS {
            return Err(err);
        }

        let delay = backoff_delay(attempt).min(deadline.remaining());
        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying LM call");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::Deadline;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyClient {
        calls: AtomicU32,
        fail_first: u32,
        retryable: bool,
    }

    #[async_trait]
    impl LLMClient for FlakyClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(Error::provider("mock", "503 service unavailable", self.retryable));
            }
            Ok(CompletionResponse {
                id: "mock-1".to_string(),
                model: "mock-model".to_string(),
                content: "ok".to_string(),
                usage: TokenUsage::new(10, 5),
                timestamp: Utc::now(),
            })
        }

        fn provider(&self) -> Provider {
            Provider::OpenAI
        }
    }

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfig::new("test-key")
            .with_base_url("https://custom.api.com")
            .with_default_model("claude-3-5-haiku-20241022")
            .with_timeout(60);

        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.base_url, Some("https://custom.api.com".to_string()));
        assert_eq!(config.timeout_secs, 60);
    }

    #[test]
    fn test_transient_statuses() {
        assert!(status_is_transient(StatusCode::SERVICE_UNAVAILABLE));
        assert!(status_is_transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(!status_is_transient(StatusCode::BAD_REQUEST));
        assert!(!status_is_transient(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_backoff_grows_with_jitter() {
        for attempt in 1..=3 {
            let base = 1000u64 * 2u64.pow(attempt - 1);
            let delay = backoff_delay(attempt).as_millis() as u64;
            assert!(delay >= base * 3 / 4, "attempt {attempt}: {delay}");
            assert!(delay <= base * 5 / 4 + 1, "attempt {attempt}: {delay}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_errors() {
        let client = FlakyClient {
            calls: AtomicU32::new(0),
            fail_first: 2,
            retryable: true,
        };
        let deadline = Deadline::after(Duration::from_secs(300));

        let response =
            complete_with_retry(&client, CompletionRequest::new(), &deadline, Duration::from_secs(120))
                .await
                .unwrap();

        assert_eq!(response.content, "ok");
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_three_attempts() {
        let client = FlakyClient {
            calls: AtomicU32::new(0),
            fail_first: 10,
            retryable: true,
        };
        let deadline = Deadline::after(Duration::from_secs(300));

        let err =
            complete_with_retry(&client, CompletionRequest::new(), &deadline, Duration::from_secs(120))
                .await
                .unwrap_err();

        assert!(matches!(err, Error::Provider { .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_fast() {
        let client = FlakyClient {
            calls: AtomicU32::new(0),
            fail_first: 10,
            retryable: false,
        };
        let deadline = Deadline::after(Duration::from_secs(300));

        let err =
            complete_with_retry(&client, CompletionRequest::new(), &deadline, Duration::from_secs(120))
                .await
                .unwrap_err();

        assert!(matches!(err, Error::Provider { .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_deadline_short_circuits() {
        let client = FlakyClient {
            calls: AtomicU32::new(0),
            fail_first: 0,
            retryable: true,
        };
        let deadline = Deadline::after(Duration::ZERO);

        let err =
            complete_with_retry(&client, CompletionRequest::new(), &deadline, Duration::from_secs(120))
                .await
                .unwrap_err();

        assert!(matches!(err, Error::DeadlineExceeded));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }
}
