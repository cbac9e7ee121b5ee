//! Model client layer: one call contract over every configured backend.
//!
//! Wraps the provider adapters with per-backend timeouts, retry, token and
//! cost accounting, and a best-effort concurrent fan-out.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use futures_util::future::join_all;
use td_core::config::TandemConfig;
use td_core::{CredentialProvider, ProviderKind};
use td_telemetry::metrics::{global_metrics, BACKEND_CALLS_TOTAL, BACKEND_CALL_DURATION_SECONDS};
use td_telemetry::tracing_setup::{create_backend_span, generate_trace_id};
use tracing::{debug, warn, Instrument};

use crate::backends::{BackendCatalog, BackendInfo};
use crate::llm::{
    AnthropicProvider, GeminiProvider, LlmError, LlmProvider, LlmRequest, LlmResponse,
    LocalProvider, MockProvider, OpenAiProvider,
};
use crate::retry::{with_retry, RetryPolicy};

/// Chars-per-token ratio when the backend is unknown.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

// ---------------------------------------------------------------------------
// Fan-out results
// ---------------------------------------------------------------------------

/// One backend that did not produce a response.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendFailure {
    pub backend: String,
    pub error: LlmError,
}

/// Responses in requested order plus whatever failed.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub responses: Vec<LlmResponse>,
    pub failures: Vec<BackendFailure>,
}

/// Every attempted backend failed.
#[derive(Debug, Clone, PartialEq)]
pub struct AllBackendsFailed {
    pub failures: Vec<BackendFailure>,
}

impl fmt::Display for AllBackendsFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all {} backends failed: ", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{} ({})", failure.backend, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AllBackendsFailed {}

// ---------------------------------------------------------------------------
// ModelClient
// ---------------------------------------------------------------------------

/// Dispatches requests to backends by id. Cheap to clone.
#[derive(Clone)]
pub struct ModelClient {
    catalog: Arc<BackendCatalog>,
    providers: Arc<AHashMap<String, Arc<dyn LlmProvider>>>,
    /// Backend id → env var that would hold its missing credential.
    missing_credentials: Arc<AHashMap<String, String>>,
    retry: RetryPolicy,
    default_timeout: Duration,
}

impl ModelClient {
    /// A client with no providers registered; see [`Self::with_provider`].
    pub fn new(catalog: Arc<BackendCatalog>) -> Self {
        Self {
            catalog,
            providers: Arc::new(AHashMap::new()),
            missing_credentials: Arc::new(AHashMap::new()),
            retry: RetryPolicy::default(),
            default_timeout: Duration::from_secs(30),
        }
    }

    /// Build adapters for every catalog backend whose credential is present.
    pub fn from_config(config: &TandemConfig, catalog: Arc<BackendCatalog>) -> Self {
        let providers_cfg = &config.providers;
        let mut providers: AHashMap<String, Arc<dyn LlmProvider>> = AHashMap::new();
        let mut missing: AHashMap<String, String> = AHashMap::new();

        for backend in catalog.iter() {
            let key = CredentialProvider::api_key(backend.provider, providers_cfg);
            let provider: Option<Arc<dyn LlmProvider>> = match backend.provider {
                ProviderKind::Anthropic => key.map(|k| {
                    let base = backend
                        .base_url
                        .clone()
                        .or_else(|| providers_cfg.anthropic_base_url.clone());
                    let p = AnthropicProvider::new(k);
                    Arc::new(match base {
                        Some(url) => p.with_base_url(url),
                        None => p,
                    }) as Arc<dyn LlmProvider>
                }),
                ProviderKind::OpenAi => key.map(|k| {
                    let base = backend
                        .base_url
                        .clone()
                        .or_else(|| providers_cfg.openai_base_url.clone());
                    let p = OpenAiProvider::new(k);
                    Arc::new(match base {
                        Some(url) => p.with_base_url(url),
                        None => p,
                    }) as Arc<dyn LlmProvider>
                }),
                ProviderKind::Google => key.map(|k| {
                    let base = backend
                        .base_url
                        .clone()
                        .or_else(|| providers_cfg.google_base_url.clone());
                    let p = GeminiProvider::new(k);
                    Arc::new(match base {
                        Some(url) => p.with_base_url(url),
                        None => p,
                    }) as Arc<dyn LlmProvider>
                }),
                ProviderKind::Local => {
                    let base = backend
                        .base_url
                        .clone()
                        .unwrap_or_else(|| providers_cfg.local_base_url.clone());
                    Some(Arc::new(LocalProvider::new(base, key)) as Arc<dyn LlmProvider>)
                }
                ProviderKind::Mock if config.general.allow_mock_backends => {
                    Some(Arc::new(MockProvider::new()) as Arc<dyn LlmProvider>)
                }
                ProviderKind::Mock => {
                    warn!(backend = %backend.id, "mock backends are disabled, skipping");
                    continue;
                }
            };

            match provider {
                Some(p) => {
                    providers.insert(backend.id.clone(), p);
                }
                None => {
                    let env_var = providers_cfg
                        .key_env_for(backend.provider)
                        .unwrap_or_default()
                        .to_string();
                    debug!(backend = %backend.id, env_var = %env_var, "credential not set, backend disabled");
                    missing.insert(backend.id.clone(), env_var);
                }
            }
        }

        debug!(
            available = providers.len(),
            disabled = missing.len(),
            "model client configured"
        );

        Self {
            catalog,
            providers: Arc::new(providers),
            missing_credentials: Arc::new(missing),
            retry: RetryPolicy::from_config(&config.retry),
            default_timeout: Duration::from_secs(config.retry.default_timeout_secs),
        }
    }

    /// Register (or replace) the adapter serving `backend`.
    pub fn with_provider(mut self, backend: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        let backend = backend.into();
        Arc::make_mut(&mut self.missing_credentials).remove(&backend);
        Arc::make_mut(&mut self.providers).insert(backend, provider);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Timeout for backends that do not set `timeout_secs`.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn catalog(&self) -> &Arc<BackendCatalog> {
        &self.catalog
    }

    /// Catalog ids that have a usable provider, in catalog order.
    pub fn available_backends(&self) -> Vec<String> {
        self.catalog
            .iter()
            .filter(|b| self.providers.contains_key(&b.id))
            .map(|b| b.id.clone())
            .collect()
    }

    fn backend(&self, id: &str) -> Result<&BackendInfo, LlmError> {
        self.catalog
            .get(id)
            .ok_or_else(|| LlmError::UnknownBackend(id.to_string()))
    }

    // -- Estimation --

    /// `ceil(chars / chars_per_token)` using the backend's vendor ratio, or
    /// 4.0 when no backend is given.
    pub fn estimate_tokens(&self, text: &str, backend: Option<&str>) -> u64 {
        let ratio = backend
            .and_then(|id| self.catalog.get(id))
            .map(|b| b.provider.chars_per_token())
            .unwrap_or(DEFAULT_CHARS_PER_TOKEN);
        estimate_tokens_with_ratio(text, ratio)
    }

    pub fn estimate_cost(
        &self,
        backend: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<f64, LlmError> {
        Ok(self.backend(backend)?.estimate_cost(input_tokens, output_tokens))
    }

    // -- Calls --

    /// Call one backend with retry and its timeout.
    pub async fn call(&self, backend: &str, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let trace_id = generate_trace_id();
        self.call_traced(backend, request, &trace_id)
            .instrument(create_backend_span(&trace_id, backend))
            .await
    }

    async fn call_traced(
        &self,
        backend_id: &str,
        request: &LlmRequest,
        trace_id: &str,
    ) -> Result<LlmResponse, LlmError> {
        let backend = self.backend(backend_id)?;
        let provider = match self.providers.get(backend_id) {
            Some(p) => p.clone(),
            None => {
                return Err(match self.missing_credentials.get(backend_id) {
                    Some(env_var) => LlmError::MissingCredential {
                        backend: backend_id.to_string(),
                        env_var: env_var.clone(),
                    },
                    None => LlmError::UnknownBackend(backend_id.to_string()),
                })
            }
        };

        let timeout = backend.timeout(self.default_timeout);
        let model = backend.model.as_str();
        let started = Instant::now();
        let mut attempts = 0u32;

        let outcome = with_retry(&self.retry, backend_id, |attempt| {
            attempts = attempt + 1;
            debug!(backend = backend_id, trace_id, attempt = attempts, "dispatching");
            let provider = &provider;
            async move {
                match tokio::time::timeout(timeout, provider.complete(model, request)).await {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout),
                }
            }
        })
        .await;

        let elapsed = started.elapsed();
        let metrics = global_metrics();
        metrics.record_histogram(BACKEND_CALL_DURATION_SECONDS, elapsed.as_secs_f64());

        let completion = match outcome {
            Ok(c) => {
                metrics.increment_counter(
                    BACKEND_CALLS_TOTAL,
                    &[("backend", backend_id), ("outcome", "ok")],
                );
                c
            }
            Err(err) => {
                metrics.increment_counter(
                    BACKEND_CALLS_TOTAL,
                    &[("backend", backend_id), ("outcome", "error")],
                );
                warn!(backend = backend_id, trace_id, attempts, error = %err, "backend call failed");
                return Err(err);
            }
        };

        let ratio = backend.provider.chars_per_token();
        let tokens_estimated = completion.input_tokens.is_none() || completion.output_tokens.is_none();
        let input_tokens = completion
            .input_tokens
            .unwrap_or_else(|| estimate_tokens_with_ratio(&request.input_text(), ratio));
        let output_tokens = completion
            .output_tokens
            .unwrap_or_else(|| estimate_tokens_with_ratio(&completion.content, ratio));

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "model".to_string(),
            serde_json::json!(completion.model.as_deref().unwrap_or(model)),
        );
        metadata.insert("attempts".to_string(), serde_json::json!(attempts));
        metadata.insert("tokens_estimated".to_string(), serde_json::json!(tokens_estimated));
        metadata.insert("trace_id".to_string(), serde_json::json!(trace_id));

        let response = LlmResponse {
            backend: backend.id.clone(),
            provider: backend.provider,
            content: completion.content,
            finish_reason: completion.finish_reason,
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cost: backend.estimate_cost(input_tokens, output_tokens),
            latency_ms: elapsed.as_millis() as u64,
            timestamp: chrono::Utc::now(),
            metadata,
        };

        debug!(
            backend = backend_id,
            trace_id,
            tokens = response.total_tokens,
            cost = response.cost,
            latency_ms = response.latency_ms,
            "backend call succeeded"
        );
        Ok(response)
    }

    /// Call every backend concurrently and wait for all of them.
    ///
    /// Failures never abort siblings. Responses keep the requested order. An
    /// empty `backends` slice yields an empty outcome.
    pub async fn call_many(
        &self,
        backends: &[String],
        request: &LlmRequest,
    ) -> Result<BatchOutcome, AllBackendsFailed> {
        self.call_many_traced(backends, request, &generate_trace_id())
            .await
    }

    /// [`Self::call_many`] under an existing trace id.
    pub async fn call_many_traced(
        &self,
        backends: &[String],
        request: &LlmRequest,
        trace_id: &str,
    ) -> Result<BatchOutcome, AllBackendsFailed> {
        let handles: Vec<_> = backends
            .iter()
            .map(|id| {
                let client = self.clone();
                let id = id.clone();
                let request = request.clone();
                let trace = trace_id.to_string();
                let span = create_backend_span(trace_id, &id);
                tokio::spawn(
                    async move { client.call_traced(&id, &request, &trace).await }.instrument(span),
                )
            })
            .collect();

        let settled = join_all(handles).await;

        let mut outcome = BatchOutcome::default();
        for (id, joined) in backends.iter().zip(settled) {
            let result = joined
                .unwrap_or_else(|e| Err(LlmError::HttpError(format!("backend task aborted: {e}"))));
            match result {
                Ok(response) => outcome.responses.push(response),
                Err(error) => outcome.failures.push(BackendFailure {
                    backend: id.clone(),
                    error,
                }),
            }
        }

        if !backends.is_empty() && outcome.responses.is_empty() {
            return Err(AllBackendsFailed {
                failures: outcome.failures,
            });
        }
        if !outcome.failures.is_empty() {
            warn!(
                trace_id,
                succeeded = outcome.responses.len(),
                failed = outcome.failures.len(),
                "partial backend failure"
            );
        }
        Ok(outcome)
    }
}

/// `ceil(chars / ratio)`; zero for empty text.
pub fn estimate_tokens_with_ratio(text: &str, ratio: f64) -> u64 {
    let chars = text.chars().count();
    if chars == 0 || ratio <= 0.0 {
        return 0;
    }
    (chars as f64 / ratio).ceil() as u64
}
