//! Orchestrator: the single entry point tying routing, dispatch, consensus
//! and cost tracking together.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use td_core::config::{ConfigError, TandemConfig};
use td_core::{CredentialProvider, ProviderKind, TaskCategory};
use td_telemetry::metrics::{global_metrics, ORCHESTRATIONS_TOTAL};
use td_telemetry::tracing_setup::create_operation_span;
use thiserror::Error;
use tracing::{debug, info, Instrument};

use crate::backends::BackendCatalog;
use crate::client::{AllBackendsFailed, ModelClient};
use crate::consensus::{ConsensusEngine, ConsensusError, ConsensusMethod, ConsensusResult};
use crate::cost_tracker::{BudgetCheck, CostTags, CostTracker};
use crate::embedding::OpenAiEmbedder;
use crate::llm::{LlmRequest, LlmResponse};
use crate::model_router::{Router, RouterError, RoutingPreferences, RoutingSettings};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    AllBackendsFailed(#[from] AllBackendsFailed),

    #[error("consensus failed: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("routing failed: {0}")]
    Router(#[from] RouterError),

    #[error("budget exceeded: {reason}")]
    BudgetExceeded { reason: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Single,
    Dual,
    Triple,
    /// Caller-supplied backend list.
    Custom,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Dual => "dual",
            Self::Triple => "triple",
            Self::Custom => "custom",
        }
    }

    /// Backends a routed strategy asks for; `None` for custom.
    pub fn backend_count(&self) -> Option<usize> {
        match self {
            Self::Single => Some(1),
            Self::Dual => Some(2),
            Self::Triple => Some(3),
            Self::Custom => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop: Vec<String>,
    /// Explicit backends, used verbatim and in order.
    #[serde(default)]
    pub backends: Option<Vec<String>>,
    /// Defaults to single when no backends are given.
    #[serde(default)]
    pub strategy: Option<Strategy>,
    /// Skips classification when set.
    #[serde(default)]
    pub task_type: Option<TaskCategory>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub preferences: RoutingPreferences,
    /// Defaults to true whenever more than one response comes back.
    #[serde(default)]
    pub consensus: Option<bool>,
    #[serde(default)]
    pub consensus_method: Option<ConsensusMethod>,
}

impl OrchestrationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_backends<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backends = Some(backends.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_task_type(mut self, task_type: TaskCategory) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_preferences(mut self, preferences: RoutingPreferences) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn with_consensus(mut self, enabled: bool) -> Self {
        self.consensus = Some(enabled);
        self
    }

    pub fn with_consensus_method(mut self, method: ConsensusMethod) -> Self {
        self.consensus_method = Some(method);
        self
    }

    fn to_llm_request(&self) -> LlmRequest {
        let mut request = LlmRequest::new(self.prompt.clone());
        request.system_prompt = self.system_prompt.clone();
        if let Some(t) = self.temperature {
            request.temperature = t;
        }
        if let Some(m) = self.max_tokens {
            request.max_tokens = m;
        }
        request.top_p = self.top_p;
        request.stop = self.stop.clone();
        request
    }

    fn tags(&self, task_type: TaskCategory) -> CostTags {
        CostTags {
            task_type: Some(task_type),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

/// Everything one orchestration produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub strategy: Strategy,
    pub task_type: TaskCategory,
    /// Successful responses in requested backend order.
    pub responses: Vec<LlmResponse>,
    pub consensus: Option<ConsensusResult>,
    pub primary_answer: String,
    pub total_cost: f64,
    /// Wall clock for the whole orchestration.
    pub latency_ms: u64,
    pub trace_id: String,
    /// `backends_used`, `failures`, `routing_rationale` and, when the
    /// strategy was capped, `strategy_adjustment`.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl OrchestrationResult {
    pub fn requires_review(&self) -> bool {
        self.consensus.as_ref().is_some_and(|c| c.requires_review)
    }

    /// Pass the primary answer through an output filter for `role`.
    pub fn filtered_answer(&self, filter: &dyn OutputFilter, role: &str) -> String {
        let context = FilterContext {
            role: role.to_string(),
            task_type: self.task_type,
            backends: self.responses.iter().map(|r| r.backend.clone()).collect(),
            requires_review: self.requires_review(),
        };
        filter.filter(&self.primary_answer, &context)
    }
}

// ---------------------------------------------------------------------------
// Output filtering seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct FilterContext {
    pub role: String,
    pub task_type: TaskCategory,
    pub backends: Vec<String>,
    pub requires_review: bool,
}

/// Role-based redaction applied by the caller. The orchestrator never
/// redacts on its own.
pub trait OutputFilter: Send + Sync {
    fn filter(&self, answer: &str, context: &FilterContext) -> String;
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct Plan {
    strategy: Strategy,
    task_type: TaskCategory,
    backends: Vec<String>,
    estimated_output_tokens: u64,
    rationale: String,
    adjustment: Option<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    client: ModelClient,
    router: Router,
    consensus: Arc<ConsensusEngine>,
    tracker: CostTracker,
}

impl Orchestrator {
    pub fn new(
        client: ModelClient,
        router: Router,
        consensus: ConsensusEngine,
        tracker: CostTracker,
    ) -> Self {
        Self {
            client,
            router,
            consensus: Arc::new(consensus),
            tracker,
        }
    }

    /// Wire every component from one validated config. Routing only
    /// considers backends whose credentials are present.
    pub fn from_config(config: &TandemConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let catalog = Arc::new(BackendCatalog::from_config(config));
        let client = ModelClient::from_config(config, catalog.clone());

        let available = client.available_backends();
        let routable = BackendCatalog::new(
            catalog
                .iter()
                .filter(|b| available.contains(&b.id))
                .cloned(),
        );
        let router = Router::new(Arc::new(routable), RoutingSettings::from_config(&config.routing)?);

        let mut consensus = ConsensusEngine::new(config.consensus.clone());
        if config.providers.remote_embeddings {
            match CredentialProvider::api_key(ProviderKind::OpenAi, &config.providers) {
                Some(key) => {
                    let embedder = OpenAiEmbedder::new(key, config.providers.embedding_model.clone());
                    let embedder = match &config.providers.openai_base_url {
                        Some(url) => embedder.with_base_url(url.clone()),
                        None => embedder,
                    };
                    consensus = consensus.with_embedder(Arc::new(embedder));
                }
                None => debug!("remote embeddings requested without an OpenAI key, using lexical"),
            }
        }

        let tracker = CostTracker::new(config.budget.clone());

        info!(
            backends = catalog.len(),
            available = available.len(),
            "orchestrator configured"
        );
        Ok(Self::new(client, router, consensus, tracker))
    }

    pub fn client(&self) -> &ModelClient {
        &self.client
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn consensus(&self) -> &ConsensusEngine {
        &self.consensus
    }

    pub fn tracker(&self) -> &CostTracker {
        &self.tracker
    }

    /// Hot-swap routing rules, consensus thresholds and budget. The backend
    /// catalog and credentials are fixed at construction.
    pub async fn reload(&self, config: &TandemConfig) -> Result<(), OrchestratorError> {
        config.validate()?;
        let routing = RoutingSettings::from_config(&config.routing)?;
        self.router.reload(routing).await;
        self.consensus.reload(config.consensus.clone()).await;
        self.tracker.reload(config.budget.clone()).await;
        Ok(())
    }

    pub async fn orchestrate(
        &self,
        request: OrchestrationRequest,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        let (span, trace_id) = create_operation_span("orchestrate");
        self.orchestrate_traced(request, trace_id).instrument(span).await
    }

    async fn orchestrate_traced(
        &self,
        request: OrchestrationRequest,
        trace_id: String,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        let started = Instant::now();
        let llm_request = request.to_llm_request();
        let plan = self.plan(&request, &llm_request).await?;

        let estimate = self.estimate_cost(&plan, &llm_request);
        if let BudgetCheck::Denied { reason } = self.tracker.enforce_budget(estimate).await {
            return Err(OrchestratorError::BudgetExceeded { reason });
        }

        debug!(strategy = %plan.strategy, backends = ?plan.backends, "dispatching");
        let outcome = self
            .client
            .call_many_traced(&plan.backends, &llm_request, &trace_id)
            .await?;
        let responses = outcome.responses;

        self.tracker
            .track_many(&responses, &request.tags(plan.task_type))
            .await;

        let want_consensus = request.consensus.unwrap_or(true);
        let consensus = if responses.len() > 1 && want_consensus {
            Some(
                self.consensus
                    .build(&responses, request.consensus_method)
                    .await?,
            )
        } else {
            None
        };

        let primary_answer = match (&consensus, responses.first()) {
            (Some(c), _) => c.content.clone(),
            (None, Some(first)) => first.content.clone(),
            (None, None) => {
                return Err(OrchestratorError::InvalidRequest(
                    "no backends selected".to_string(),
                ))
            }
        };

        let total_cost: f64 = responses.iter().map(|r| r.cost).sum();
        let latency_ms = started.elapsed().as_millis() as u64;

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "backends_used".to_string(),
            serde_json::json!(responses.iter().map(|r| r.backend.as_str()).collect::<Vec<_>>()),
        );
        metadata.insert(
            "failures".to_string(),
            serde_json::Value::Array(
                outcome
                    .failures
                    .iter()
                    .map(|f| serde_json::json!({ "backend": f.backend, "error": f.error.to_string() }))
                    .collect(),
            ),
        );
        metadata.insert("routing_rationale".to_string(), serde_json::json!(plan.rationale));
        if let Some(adjustment) = &plan.adjustment {
            metadata.insert("strategy_adjustment".to_string(), serde_json::json!(adjustment));
        }

        global_metrics().increment_counter(ORCHESTRATIONS_TOTAL, &[("strategy", plan.strategy.as_str())]);
        info!(
            trace_id = %trace_id,
            strategy = %plan.strategy,
            task_type = %plan.task_type,
            responses = responses.len(),
            failures = outcome.failures.len(),
            total_cost,
            latency_ms,
            requires_review = consensus.as_ref().is_some_and(|c| c.requires_review),
            "orchestration complete"
        );

        Ok(OrchestrationResult {
            strategy: plan.strategy,
            task_type: plan.task_type,
            responses,
            consensus,
            primary_answer,
            total_cost,
            latency_ms,
            trace_id,
            metadata,
        })
    }

    async fn plan(
        &self,
        request: &OrchestrationRequest,
        llm_request: &LlmRequest,
    ) -> Result<Plan, OrchestratorError> {
        let analysis = self
            .router
            .analyze(&request.prompt, request.system_prompt.as_deref());

        if let Some(backends) = request.backends.as_ref().filter(|b| !b.is_empty()) {
            return Ok(Plan {
                strategy: Strategy::Custom,
                task_type: request
                    .task_type
                    .unwrap_or(analysis.classification.category),
                backends: backends.clone(),
                estimated_output_tokens: analysis.estimated_output_tokens,
                rationale: "caller-specified backends".to_string(),
                adjustment: None,
            });
        }

        let strategy = request.strategy.unwrap_or(Strategy::Single);
        let Some(wanted) = strategy.backend_count() else {
            return Err(OrchestratorError::InvalidRequest(
                "custom strategy requires a backend list".to_string(),
            ));
        };

        let system = request.system_prompt.as_deref();
        let mut preferences = request.preferences.clone();
        if preferences.max_output_tokens.is_none() {
            preferences.max_output_tokens = Some(llm_request.max_tokens);
        }
        let decision = match request.task_type {
            Some(category) => {
                self.router
                    .route_as(category, &request.prompt, system, &preferences)
                    .await?
            }
            None => {
                self.router
                    .route(&request.prompt, system, &preferences)
                    .await?
            }
        };

        let mut backends = decision.ordered();
        let adjustment = if backends.len() < wanted {
            Some(format!(
                "{strategy} requested {wanted} backends but only {} are available",
                backends.len()
            ))
        } else {
            backends.truncate(wanted);
            None
        };

        Ok(Plan {
            strategy,
            task_type: decision.task_type,
            backends,
            estimated_output_tokens: analysis.estimated_output_tokens,
            rationale: decision.rationale,
            adjustment,
        })
    }

    /// Projected spend for a plan; unknown backends count as free.
    fn estimate_cost(&self, plan: &Plan, request: &LlmRequest) -> f64 {
        let input = request.input_text();
        let output = plan
            .estimated_output_tokens
            .min(u64::from(request.max_tokens));
        plan.backends
            .iter()
            .map(|b| {
                let tokens = self.client.estimate_tokens(&input, Some(b));
                self.client.estimate_cost(b, tokens, output).unwrap_or(0.0)
            })
            .sum()
    }

    // -- Convenience wrappers --

    /// One routed backend, answer text only.
    pub async fn ask(&self, prompt: impl Into<String>) -> Result<String, OrchestratorError> {
        let result = self
            .orchestrate(OrchestrationRequest::new(prompt).with_strategy(Strategy::Single))
            .await?;
        Ok(result.primary_answer)
    }

    /// Dual or triple with consensus. Any other strategy runs as dual.
    pub async fn ask_with_consensus(
        &self,
        prompt: impl Into<String>,
        strategy: Strategy,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        let strategy = match strategy {
            Strategy::Triple => Strategy::Triple,
            _ => Strategy::Dual,
        };
        self.orchestrate(
            OrchestrationRequest::new(prompt)
                .with_strategy(strategy)
                .with_consensus(true),
        )
        .await
    }

    /// Every available backend, with consensus.
    pub async fn compare_all(
        &self,
        prompt: impl Into<String>,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        let backends = self.client.available_backends();
        if backends.is_empty() {
            return Err(OrchestratorError::Router(RouterError::NoBackends));
        }
        self.orchestrate(
            OrchestrationRequest::new(prompt)
                .with_backends(backends)
                .with_consensus(true),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{builtin_backends, CLAUDE_SONNET, GEMINI_PRO, GPT_4O};
    use crate::llm::{LlmError, MockProvider};
    use crate::retry::RetryPolicy;
    use td_core::config::{BudgetConfig, ConsensusConfig};

    fn orchestrator_with(mocks: Vec<(&str, MockProvider)>, budget: BudgetConfig) -> Orchestrator {
        let ids: Vec<String> = mocks.iter().map(|(id, _)| id.to_string()).collect();
        let catalog = Arc::new(BackendCatalog::new(
            builtin_backends().into_iter().filter(|b| ids.contains(&b.id)),
        ));
        let mut client = ModelClient::new(catalog.clone()).with_retry_policy(RetryPolicy::immediate(1));
        for (id, mock) in mocks {
            client = client.with_provider(id, Arc::new(mock));
        }
        Orchestrator::new(
            client,
            Router::new(catalog, RoutingSettings::default()),
            ConsensusEngine::new(ConsensusConfig::default()),
            CostTracker::new(budget),
        )
    }

    fn all_three(text: &str) -> Vec<(&'static str, MockProvider)> {
        vec![
            (CLAUDE_SONNET, MockProvider::new().with_default_text(text)),
            (GPT_4O, MockProvider::new().with_default_text(text)),
            (GEMINI_PRO, MockProvider::new().with_default_text(text)),
        ]
    }

    #[tokio::test]
    async fn single_strategy_skips_consensus() {
        let orch = orchestrator_with(all_three("fine"), BudgetConfig::default());
        let result = orch
            .orchestrate(OrchestrationRequest::new("Write a short poem about rain"))
            .await
            .unwrap();
        assert_eq!(result.strategy, Strategy::Single);
        assert_eq!(result.responses.len(), 1);
        assert!(result.consensus.is_none());
        assert_eq!(result.primary_answer, "fine");
        assert_eq!(result.trace_id.len(), 32);
    }

    #[tokio::test]
    async fn triple_runs_consensus_and_tracks_every_response() {
        let orch = orchestrator_with(all_three("yes"), BudgetConfig::default());
        let result = orch
            .orchestrate(
                OrchestrationRequest::new("Is this spam?")
                    .with_strategy(Strategy::Triple)
                    .with_user("u1"),
            )
            .await
            .unwrap();
        assert_eq!(result.responses.len(), 3);
        let consensus = result.consensus.as_ref().unwrap();
        assert_eq!(consensus.agreement, 1.0);
        assert_eq!(result.primary_answer, "yes");

        let stats = orch.tracker().get_stats(None, None).await;
        assert_eq!(stats.total_requests, 3);
        assert!(stats.by_user.contains_key("u1"));
    }

    #[tokio::test]
    async fn triple_is_capped_when_fallbacks_are_missing() {
        let orch = orchestrator_with(
            vec![
                (CLAUDE_SONNET, MockProvider::new()),
                (GPT_4O, MockProvider::new()),
            ],
            BudgetConfig::default(),
        );
        let result = orch
            .orchestrate(OrchestrationRequest::new("hello").with_strategy(Strategy::Triple))
            .await
            .unwrap();
        assert_eq!(result.responses.len(), 2);
        assert!(result.metadata.contains_key("strategy_adjustment"));
    }

    #[tokio::test]
    async fn custom_backends_are_used_in_order() {
        let orch = orchestrator_with(all_three("same"), BudgetConfig::default());
        let result = orch
            .orchestrate(
                OrchestrationRequest::new("anything")
                    .with_backends([GEMINI_PRO, CLAUDE_SONNET])
                    .with_consensus(false),
            )
            .await
            .unwrap();
        assert_eq!(result.strategy, Strategy::Custom);
        let order: Vec<_> = result.responses.iter().map(|r| r.backend.as_str()).collect();
        assert_eq!(order, vec![GEMINI_PRO, CLAUDE_SONNET]);
        assert!(result.consensus.is_none());
    }

    #[tokio::test]
    async fn custom_strategy_without_backends_is_rejected() {
        let orch = orchestrator_with(all_three("x"), BudgetConfig::default());
        let err = orch
            .orchestrate(OrchestrationRequest::new("x").with_strategy(Strategy::Custom))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn partial_failure_is_reported_in_metadata() {
        let orch = orchestrator_with(
            vec![
                (CLAUDE_SONNET, MockProvider::new().with_default_text("ok")),
                (
                    GPT_4O,
                    MockProvider::new().with_error(LlmError::ApiError {
                        status: 400,
                        message: "bad request".into(),
                    }),
                ),
                (GEMINI_PRO, MockProvider::new().with_default_text("ok")),
            ],
            BudgetConfig::default(),
        );
        let result = orch
            .orchestrate(
                OrchestrationRequest::new("x")
                    .with_backends([CLAUDE_SONNET, GPT_4O, GEMINI_PRO]),
            )
            .await
            .unwrap();
        assert_eq!(result.responses.len(), 2);
        let failures = result.metadata["failures"].as_array().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0]["backend"], GPT_4O);
    }

    #[tokio::test]
    async fn hard_stop_blocks_before_dispatch() {
        let mock = Arc::new(MockProvider::new());
        let catalog = Arc::new(BackendCatalog::new(
            builtin_backends().into_iter().filter(|b| b.id == GPT_4O),
        ));
        let client = ModelClient::new(catalog.clone()).with_provider(GPT_4O, mock.clone());
        let budget = BudgetConfig {
            per_request_limit: Some(0.0),
            hard_stop: true,
            ..BudgetConfig::default()
        };
        let orch = Orchestrator::new(
            client,
            Router::new(catalog, RoutingSettings::default()),
            ConsensusEngine::new(ConsensusConfig::default()),
            CostTracker::new(budget),
        );
        let err = orch.ask("summarize this document please").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::BudgetExceeded { .. }));
        assert_eq!(mock.call_count(), 0);
    }

    struct Upper;

    impl OutputFilter for Upper {
        fn filter(&self, answer: &str, context: &FilterContext) -> String {
            format!("{}:{}", context.role, answer.to_uppercase())
        }
    }

    #[tokio::test]
    async fn filtered_answer_receives_context() {
        let orch = orchestrator_with(all_three("quiet"), BudgetConfig::default());
        let result = orch.orchestrate(OrchestrationRequest::new("hi")).await.unwrap();
        assert_eq!(result.filtered_answer(&Upper, "viewer"), "viewer:QUIET");
    }
}
