//! LLM provider abstraction layer.
//!
//! A single async trait covers the language-model capability the engine
//! consumes: full completions and incremental (streamed) completions.
//! [`AnthropicProvider`] talks to the Messages API; [`MockProvider`] replays
//! queued responses for tests.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur when interacting with an LLM provider.
#[derive(Debug, Error)]
pub enum LlmError {
    /// An HTTP-level error (connection failure, DNS, TLS, etc.).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The API returned a non-success status with a message.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Failed to parse the API response body.
    #[error("parse error: {0}")]
    ParseError(String),

    /// The API indicated rate limiting (HTTP 429).
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// No provider is configured.
    #[error("language model unavailable")]
    Unavailable,
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::HttpError(err.to_string())
        }
    }
}

/// Boxed stream of text deltas.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

// ---------------------------------------------------------------------------
// Core data types
// ---------------------------------------------------------------------------

/// Role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    System,
    User,
    Assistant,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    pub fn new(role: LlmRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LlmRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(LlmRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(LlmRole::Assistant, content)
    }
}

/// Configuration for an LLM completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 4096,
            temperature: 0.3,
            system_prompt: None,
        }
    }
}

impl LlmConfig {
    pub fn from_providers(cfg: &tp_core::config::ProvidersConfig) -> Self {
        Self {
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            ..Self::default()
        }
    }
}

/// Response from an LLM completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: String,
}

impl LlmResponse {
    /// Convenience constructor used by tests and the mock provider.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: "mock".to_string(),
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: "end_turn".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

/// Async trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a completion request and return the full response.
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError>;

    /// Stream a completion response as text deltas.
    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<TextStream, LlmError>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// AnthropicProvider
// ---------------------------------------------------------------------------

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// LLM provider for the Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    /// `api_key` is sent as the `x-api-key` header.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Build the JSON request body for the Anthropic Messages API.
    ///
    /// System messages are folded into the top-level `system` field.
    pub fn build_request_body(messages: &[LlmMessage], config: &LlmConfig) -> serde_json::Value {
        let mut system_text: Option<String> = config.system_prompt.clone();

        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .filter_map(|msg| {
                if msg.role == LlmRole::System {
                    match system_text {
                        Some(ref mut s) => {
                            s.push('\n');
                            s.push_str(&msg.content);
                        }
                        None => system_text = Some(msg.content.clone()),
                    }
                    None
                } else {
                    Some(serde_json::json!({
                        "role": msg.role,
                        "content": msg.content,
                    }))
                }
            })
            .collect();

        let mut body = serde_json::json!({
            "model": config.model,
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "messages": api_messages,
        });

        if let Some(system) = system_text {
            body["system"] = serde_json::Value::String(system);
        }

        body
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(LlmError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::ApiError {
                status,
                message: text,
            });
        }

        Ok(resp)
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

/// One `data:` payload of the Messages streaming protocol.
#[derive(Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    text: Option<String>,
}

/// Parse one SSE line. Returns `Some` for a text delta or an error event.
fn parse_sse_line(line: &str) -> Option<Result<String, LlmError>> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let event: StreamEvent = serde_json::from_str(data).ok()?;
    match event.kind.as_str() {
        "content_block_delta" => event.delta.and_then(|d| d.text).map(Ok),
        "error" => Some(Err(LlmError::ApiError {
            status: 500,
            message: event.error.map(|e| e.to_string()).unwrap_or_default(),
        })),
        _ => None,
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        let body = Self::build_request_body(messages, config);
        let resp = self.post(&body).await?;

        let api_resp: AnthropicResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let content = api_resp
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(LlmResponse {
            content,
            model: api_resp.model,
            input_tokens: api_resp.usage.input_tokens,
            output_tokens: api_resp.usage.output_tokens,
            finish_reason: api_resp.stop_reason.unwrap_or_else(|| "unknown".into()),
        })
    }

    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<TextStream, LlmError> {
        let mut body = Self::build_request_body(messages, config);
        body["stream"] = serde_json::Value::Bool(true);
        let resp = self.post(&body).await?;

        let (tx, rx) = mpsc::channel::<Result<String, LlmError>>(64);
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if let Some(item) = parse_sse_line(&line) {
                        if tx.send(item).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(receiver_stream(rx))
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

fn receiver_stream(rx: mpsc::Receiver<Result<String, LlmError>>) -> TextStream {
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

type Captured = Vec<(Vec<LlmMessage>, LlmConfig)>;

/// A mock LLM provider for testing.
///
/// Each call pops the next queued response. An empty queue yields a default
/// "Mock response". Streaming splits the popped content on whitespace.
#[derive(Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<Result<LlmResponse, LlmError>>>>,
    captured_requests: Arc<Mutex<Captured>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            captured_requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a successful response.
    pub fn with_response(self, response: LlmResponse) -> Self {
        self.responses
            .lock()
            .expect("MockProvider lock poisoned")
            .push_back(Ok(response));
        self
    }

    /// Queue a successful response with the given text.
    pub fn with_text(self, content: impl Into<String>) -> Self {
        self.with_response(LlmResponse::text(content))
    }

    /// Queue an error response.
    pub fn with_error(self, error: LlmError) -> Self {
        self.responses
            .lock()
            .expect("MockProvider lock poisoned")
            .push_back(Err(error));
        self
    }

    pub fn captured_requests(&self) -> Captured {
        self.captured_requests
            .lock()
            .expect("MockProvider lock poisoned")
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.captured_requests
            .lock()
            .expect("MockProvider lock poisoned")
            .len()
    }

    fn next(&self, messages: &[LlmMessage], config: &LlmConfig) -> Result<LlmResponse, LlmError> {
        self.captured_requests
            .lock()
            .expect("MockProvider lock poisoned")
            .push((messages.to_vec(), config.clone()));

        let mut queue = self.responses.lock().expect("MockProvider lock poisoned");
        match queue.pop_front() {
            Some(result) => result,
            None => Ok(LlmResponse {
                content: "Mock response".to_string(),
                model: config.model.clone(),
                input_tokens: 10,
                output_tokens: 5,
                finish_reason: "end_turn".to_string(),
            }),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        self.next(messages, config)
    }

    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<TextStream, LlmError> {
        let resp = self.next(messages, config)?;
        let pieces: Vec<Result<String, LlmError>> = resp
            .content
            .split_inclusive(' ')
            .map(|s| Ok(s.to_string()))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(pieces)))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ---------------------------------------------------------------------------
// LlmUsageTracker
// ---------------------------------------------------------------------------

/// Cumulative LLM usage across multiple requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmUsageTracker {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
}

impl LlmUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, response: &LlmResponse) {
        self.total_input_tokens += response.input_tokens;
        self.total_output_tokens += response.output_tokens;
        self.total_requests += 1;
    }

    pub fn record_failure(&mut self) {
        self.total_requests += 1;
        self.failed_requests += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
