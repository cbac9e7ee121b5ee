//! LLM provider abstraction layer.
//!
//! Provides the request/response contract shared by every backend, a unified
//! async trait over vendor APIs (Anthropic, OpenAI, Gemini, OpenAI-compatible
//! local servers) and a scripted mock provider for tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use td_core::ProviderKind;
use thiserror::Error;
use tokio::sync::Semaphore;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur when calling a backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LlmError {
    /// An HTTP-level error (connection failure, DNS, TLS, reset).
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

    /// The requested operation is not supported by this provider.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// No backend with this id is configured.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// The backend exists but its provider has no credential.
    #[error("missing credential for backend {backend}: set {env_var}")]
    MissingCredential { backend: String, env_var: String },
}

impl LlmError {
    /// Transient failures worth another attempt: network errors, timeouts,
    /// HTTP 429 and HTTP 5xx. Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpError(_) | Self::Timeout | Self::RateLimited { .. } => true,
            Self::ApiError { status, .. } => *status >= 500,
            Self::ParseError(_)
            | Self::Unsupported(_)
            | Self::UnknownBackend(_)
            | Self::MissingCredential { .. } => false,
        }
    }

    /// Server-provided backoff hint.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
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

// ---------------------------------------------------------------------------
// Core data types
// ---------------------------------------------------------------------------

/// One prompt sent to one or more backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 1024,
            top_p: None,
            stop: Vec::new(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        self.stop.push(stop.into());
        self
    }

    /// Prompt plus system text, the input the backend is billed for.
    pub fn input_text(&self) -> String {
        match &self.system_prompt {
            Some(system) => format!("{system}\n{}", self.prompt),
            None => self.prompt.clone(),
        }
    }
}

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Error,
}

impl FinishReason {
    /// Map a vendor stop/finish reason string.
    pub fn from_vendor(reason: &str) -> Self {
        match reason.to_ascii_lowercase().as_str() {
            "length" | "max_tokens" => Self::Length,
            "content_filter" | "safety" | "recitation" | "error" => Self::Error,
            _ => Self::Stop,
        }
    }
}

/// Raw provider output before the client layer fills in cost and latency.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub finish_reason: FinishReason,
    /// `None` when the vendor did not report usage.
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// Model name echoed by the vendor, if any.
    pub model: Option<String>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            finish_reason: FinishReason::Stop,
            input_tokens: None,
            output_tokens: None,
            model: None,
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = Some(input_tokens);
        self.output_tokens = Some(output_tokens);
        self
    }
}

/// A normalized backend response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub backend: String,
    pub provider: ProviderKind,
    pub content: String,
    pub finish_reason: FinishReason,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// USD.
    pub cost: f64,
    pub latency_ms: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

/// Async trait for vendor adapters.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Send one completion request for `model` and return the raw output.
    async fn complete(&self, model: &str, request: &LlmRequest) -> Result<Completion, LlmError>;
}

/// Map status codes to errors and decode a success body.
async fn decode_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, LlmError> {
    let status = resp.status().as_u16();

    if status == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
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

    resp.json::<T>()
        .await
        .map_err(|e| LlmError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// AnthropicProvider
// ---------------------------------------------------------------------------

/// Adapter for the Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    /// Override the base URL (useful for testing with a mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build the JSON request body for the Messages API. The system text goes
    /// in the top-level `system` field, not as a message.
    pub fn build_request_body(model: &str, request: &LlmRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        if let Some(ref system) = request.system_prompt {
            body["system"] = serde_json::Value::String(system.clone());
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if !request.stop.is_empty() {
            body["stop_sequences"] = serde_json::json!(request.stop);
        }
        body
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    model: Option<String>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
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

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn complete(&self, model: &str, request: &LlmRequest) -> Result<Completion, LlmError> {
        let body = Self::build_request_body(model, request);
        let url = format!("{}/v1/messages", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let api_resp: AnthropicResponse = decode_json(resp).await?;

        let content = api_resp
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(Completion {
            content,
            finish_reason: api_resp
                .stop_reason
                .as_deref()
                .map(FinishReason::from_vendor)
                .unwrap_or(FinishReason::Stop),
            input_tokens: api_resp.usage.as_ref().map(|u| u.input_tokens),
            output_tokens: api_resp.usage.as_ref().map(|u| u.output_tokens),
            model: api_resp.model,
        })
    }
}

// ---------------------------------------------------------------------------
// OpenAiProvider
// ---------------------------------------------------------------------------

/// Adapter for the OpenAI Chat Completions API.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com".to_string(),
        }
    }

    /// Override the base URL (useful for testing or Azure OpenAI).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build the JSON request body for Chat Completions. System text goes
    /// inline as the first message.
    pub fn build_request_body(model: &str, request: &LlmRequest) -> serde_json::Value {
        let mut messages: Vec<serde_json::Value> = Vec::new();
        if let Some(ref system) = request.system_prompt {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": request.prompt }));

        let mut body = serde_json::json!({
            "model": model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": messages,
        });
        if let Some(top_p) = request.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if !request.stop.is_empty() {
            body["stop"] = serde_json::json!(request.stop);
        }
        body
    }
}

/// Chat Completions response shape, shared with OpenAI-compatible local
/// servers.
#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    model: Option<String>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResp,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessageResp {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

impl ChatResponse {
    fn into_completion(self) -> Result<Completion, LlmError> {
        let usage = self.usage;
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ParseError("no choices in response".into()))?;
        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice
                .finish_reason
                .as_deref()
                .map(FinishReason::from_vendor)
                .unwrap_or(FinishReason::Stop),
            input_tokens: usage.as_ref().and_then(|u| u.prompt_tokens),
            output_tokens: usage.as_ref().and_then(|u| u.completion_tokens),
            model: self.model,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn complete(&self, model: &str, request: &LlmRequest) -> Result<Completion, LlmError> {
        let body = Self::build_request_body(model, request);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        decode_json::<ChatResponse>(resp).await?.into_completion()
    }
}

// ---------------------------------------------------------------------------
// GeminiProvider
// ---------------------------------------------------------------------------

/// Adapter for the Google Gemini `generateContent` API.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build the JSON request body. System text becomes `systemInstruction`;
    /// sampling parameters live under `generationConfig`.
    pub fn build_request_body(request: &LlmRequest) -> serde_json::Value {
        let mut generation = serde_json::json!({
            "temperature": request.temperature,
            "maxOutputTokens": request.max_tokens,
        });
        if let Some(top_p) = request.top_p {
            generation["topP"] = serde_json::json!(top_p);
        }
        if !request.stop.is_empty() {
            generation["stopSequences"] = serde_json::json!(request.stop);
        }

        let mut body = serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
            "generationConfig": generation,
        });
        if let Some(ref system) = request.system_prompt {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
        }
        body
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
    model_version: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn complete(&self, model: &str, request: &LlmRequest) -> Result<Completion, LlmError> {
        let body = Self::build_request_body(request);
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let api_resp: GeminiResponse = decode_json(resp).await?;
        let candidate = api_resp
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ParseError("no candidates in Gemini response".into()))?;

        let content = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        Ok(Completion {
            content,
            finish_reason: candidate
                .finish_reason
                .as_deref()
                .map(FinishReason::from_vendor)
                .unwrap_or(FinishReason::Stop),
            input_tokens: api_resp
                .usage_metadata
                .as_ref()
                .and_then(|u| u.prompt_token_count),
            output_tokens: api_resp
                .usage_metadata
                .as_ref()
                .and_then(|u| u.candidates_token_count),
            model: api_resp.model_version,
        })
    }
}

// ---------------------------------------------------------------------------
// LocalProvider
// ---------------------------------------------------------------------------

/// Adapter for OpenAI-compatible local inference servers (vllm, llama.cpp
/// server, Ollama's `/v1` endpoint, TGI).
///
/// Calls are queued through a process-wide gate sized by
/// `TANDEM_LOCAL_MAX_CONCURRENT` (default 1) so a fan-out does not overload
/// a single local GPU.
pub struct LocalProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

fn local_max_concurrent() -> usize {
    std::env::var("TANDEM_LOCAL_MAX_CONCURRENT")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(1)
}

fn local_gate() -> Arc<Semaphore> {
    static LOCAL_GATE: OnceLock<Arc<Semaphore>> = OnceLock::new();
    LOCAL_GATE
        .get_or_init(|| Arc::new(Semaphore::new(local_max_concurrent())))
        .clone()
}

impl LocalProvider {
    /// `api_key` is optional; empty strings and `"none"` count as absent.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.filter(|k| !k.is_empty() && k != "none"),
            base_url: base_url.into(),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl LlmProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn complete(&self, model: &str, request: &LlmRequest) -> Result<Completion, LlmError> {
        let _permit = local_gate()
            .acquire_owned()
            .await
            .map_err(|_| LlmError::HttpError("local inference queue unavailable".into()))?;

        let body = OpenAiProvider::build_request_body(model, request);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else if e.is_connect() {
                LlmError::HttpError(format!(
                    "cannot connect to local inference server at {}: {}",
                    self.base_url, e
                ))
            } else {
                LlmError::HttpError(e.to_string())
            }
        })?;

        decode_json::<ChatResponse>(resp).await?.into_completion()
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// A scripted provider for tests.
///
/// Each call to `complete` pops the next queued outcome. When the queue is
/// empty the default completion is returned.
pub struct MockProvider {
    outcomes: Mutex<VecDeque<Result<Completion, LlmError>>>,
    captured_requests: Mutex<Vec<(String, LlmRequest)>>,
    default_text: String,
    delay: Option<Duration>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            captured_requests: Mutex::new(Vec::new()),
            default_text: "Mock response".to_string(),
            delay: None,
        }
    }

    /// Queue a successful completion.
    pub fn with_completion(self, completion: Completion) -> Self {
        self.lock_outcomes().push_back(Ok(completion));
        self
    }

    /// Queue a completion carrying only text; token counts are left for the
    /// client layer to estimate.
    pub fn with_text(self, content: impl Into<String>) -> Self {
        self.with_completion(Completion::text(content))
    }

    /// Queue an error.
    pub fn with_error(self, error: LlmError) -> Self {
        self.lock_outcomes().push_back(Err(error));
        self
    }

    /// Text returned once the queue is drained.
    pub fn with_default_text(mut self, content: impl Into<String>) -> Self {
        self.default_text = content.into();
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `(model, request)` pairs seen so far.
    pub fn captured_requests(&self) -> Vec<(String, LlmRequest)> {
        self.captured_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.captured_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn lock_outcomes(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<Completion, LlmError>>> {
        self.outcomes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
    }

    async fn complete(&self, model: &str, request: &LlmRequest) -> Result<Completion, LlmError> {
        self.captured_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((model.to_string(), request.clone()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.lock_outcomes().pop_front();
        match next {
            Some(outcome) => outcome,
            None => Ok(Completion {
                content: self.default_text.clone(),
                finish_reason: FinishReason::Stop,
                input_tokens: Some(10),
                output_tokens: Some(5),
                model: Some(model.to_string()),
            }),
        }
    }
}
