use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{ProviderKind, SpeedClass, TaskCategory};

/// Top-level configuration loaded from `~/.tandem/config.toml`.
///
/// **Security**: This struct NEVER stores API keys. Provider sections only
/// name the environment variables that hold them; see [`CredentialProvider`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TandemConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
}

impl TandemConfig {
    /// Load config from `~/.tandem/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            let cfg = TandemConfig::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), backends = cfg.backends.len(), "config loaded");
        Ok(cfg)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: TandemConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.budget.validate()?;
        self.routing.validate()?;
        self.consensus.validate()?;

        let mut ids = BTreeSet::new();
        for backend in &self.backends {
            backend.validate()?;
            if !ids.insert(backend.id.trim()) {
                return Err(ConfigError::Validation(format!(
                    "backends contains duplicate id '{}'",
                    backend.id
                )));
            }
        }
        if !self.general.allow_mock_backends {
            if let Some(mock) = self
                .backends
                .iter()
                .find(|b| b.provider == ProviderKind::Mock)
            {
                return Err(ConfigError::Validation(format!(
                    "backend '{}' uses the mock provider; set general.allow_mock_backends to enable it",
                    mock.id
                )));
            }
        }
        Ok(())
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tandem")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

fn check_fraction(field: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Validation(format!(
            "{field} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

fn check_non_negative(field: &str, value: Option<f64>) -> Result<(), ConfigError> {
    match value {
        Some(v) if !(v >= 0.0) => Err(ConfigError::Validation(format!(
            "{field} must be non-negative, got {v}"
        ))),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    /// Seed the backend catalog with the built-in backend table before
    /// applying `[[backends]]` entries.
    #[serde(default = "default_true")]
    pub include_builtin_backends: bool,
    /// Permit `provider = "mock"` backends. Off outside of tests.
    #[serde(default)]
    pub allow_mock_backends: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            include_builtin_backends: true,
            allow_mock_backends: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_anthropic_key_env")]
    pub anthropic_key_env: String,
    #[serde(default = "default_openai_key_env")]
    pub openai_key_env: String,
    #[serde(default = "default_google_key_env")]
    pub google_key_env: String,
    #[serde(default = "default_local_api_key_env")]
    pub local_api_key_env: String,
    #[serde(default)]
    pub anthropic_base_url: Option<String>,
    #[serde(default)]
    pub openai_base_url: Option<String>,
    #[serde(default)]
    pub google_base_url: Option<String>,
    /// Local inference server base URL (OpenAI-compatible).
    #[serde(default = "default_local_base_url")]
    pub local_base_url: String,
    /// Use the OpenAI embeddings endpoint for semantic consensus instead of
    /// the offline lexical embedder.
    #[serde(default)]
    pub remote_embeddings: bool,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            anthropic_key_env: default_anthropic_key_env(),
            openai_key_env: default_openai_key_env(),
            google_key_env: default_google_key_env(),
            local_api_key_env: default_local_api_key_env(),
            anthropic_base_url: None,
            openai_base_url: None,
            google_base_url: None,
            local_base_url: default_local_base_url(),
            remote_embeddings: false,
            embedding_model: default_embedding_model(),
        }
    }
}

impl ProvidersConfig {
    /// Env-var name holding the credential for `provider`, if it uses one.
    pub fn key_env_for(&self, provider: ProviderKind) -> Option<&str> {
        match provider {
            ProviderKind::Anthropic => Some(&self.anthropic_key_env),
            ProviderKind::OpenAi => Some(&self.openai_key_env),
            ProviderKind::Google => Some(&self.google_key_env),
            ProviderKind::Local => Some(&self.local_api_key_env),
            ProviderKind::Mock => None,
        }
    }
}

fn default_anthropic_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_google_key_env() -> String {
    "GOOGLE_API_KEY".into()
}
fn default_local_api_key_env() -> String {
    "LOCAL_API_KEY".into()
}
fn default_local_base_url() -> String {
    "http://127.0.0.1:11434".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

/// Backend retry and timeout policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per backend call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Per-call timeout for backends that do not set their own.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Validation(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if self.default_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "retry.default_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_timeout_secs() -> u64 {
    30
}

/// One `[[backends]]` entry. Entries whose id matches a built-in backend
/// replace it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub provider: ProviderKind,
    /// Vendor model name; defaults to `id`.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_context_window")]
    pub context_window: u64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
    #[serde(default = "default_speed")]
    pub speed: SpeedClass,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub recommended_tasks: Vec<TaskCategory>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "backends entries must have a non-empty id".to_string(),
            ));
        }
        if !(self.input_price_per_1k >= 0.0) || !(self.output_price_per_1k >= 0.0) {
            return Err(ConfigError::Validation(format!(
                "backend '{}' prices must be non-negative",
                self.id
            )));
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::Validation(format!(
                "backend '{}' timeout_secs must be positive",
                self.id
            )));
        }
        Ok(())
    }
}

fn default_context_window() -> u64 {
    128_000
}
fn default_max_output_tokens() -> u32 {
    4096
}
fn default_speed() -> SpeedClass {
    SpeedClass::Medium
}

/// A category → backend rule override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRuleConfig {
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Estimated-cost ceiling for a single request, in USD.
    #[serde(default)]
    pub max_cost_per_request: Option<f64>,
    /// Keyed by task category name (`technical`, `summarization`, ...).
    #[serde(default)]
    pub rules: BTreeMap<String, RouteRuleConfig>,
}

impl RoutingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ceiling) = self.max_cost_per_request {
            if !(ceiling > 0.0) {
                return Err(ConfigError::Validation(format!(
                    "routing.max_cost_per_request must be positive, got {ceiling}"
                )));
            }
        }
        for (category, rule) in &self.rules {
            category
                .parse::<TaskCategory>()
                .map_err(|e| ConfigError::Validation(format!("routing.rules: {e}")))?;
            let mut seen = BTreeSet::new();
            seen.insert(rule.primary.as_str());
            for fallback in &rule.fallbacks {
                if !seen.insert(fallback.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "routing.rules.{category} lists backend '{fallback}' more than once"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rules with their category keys parsed.
    pub fn parsed_rules(&self) -> Result<Vec<(TaskCategory, RouteRuleConfig)>, ConfigError> {
        self.rules
            .iter()
            .map(|(k, v)| {
                k.parse::<TaskCategory>()
                    .map(|c| (c, v.clone()))
                    .map_err(ConfigError::Validation)
            })
            .collect()
    }
}

/// Acceptance thresholds for one consensus method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MethodThresholds {
    pub min_agreement: f64,
    pub min_confidence: f64,
    #[serde(default)]
    pub require_review: bool,
}

impl MethodThresholds {
    pub const fn new(min_agreement: f64, min_confidence: f64) -> Self {
        Self {
            min_agreement,
            min_confidence,
            require_review: false,
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        check_fraction(&format!("consensus.{name}.min_agreement"), self.min_agreement)?;
        check_fraction(&format!("consensus.{name}.min_confidence"), self.min_confidence)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_majority_thresholds")]
    pub majority_vote: MethodThresholds,
    #[serde(default = "default_weighted_thresholds")]
    pub weighted_average: MethodThresholds,
    #[serde(default = "default_semantic_thresholds")]
    pub semantic_similarity: MethodThresholds,
    #[serde(default = "default_longest_common_thresholds")]
    pub longest_common: MethodThresholds,
    #[serde(default = "default_semantic_thresholds")]
    pub confidence_weighted: MethodThresholds,
    /// Similarity to the central response below which a backend dissents.
    #[serde(default = "default_dissent_similarity")]
    pub dissent_similarity: f64,
    /// Vector width for the lexical embedder.
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            majority_vote: default_majority_thresholds(),
            weighted_average: default_weighted_thresholds(),
            semantic_similarity: default_semantic_thresholds(),
            longest_common: default_longest_common_thresholds(),
            confidence_weighted: default_semantic_thresholds(),
            dissent_similarity: default_dissent_similarity(),
            embedding_dimensions: default_embedding_dimensions(),
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.majority_vote.validate("majority_vote")?;
        self.weighted_average.validate("weighted_average")?;
        self.semantic_similarity.validate("semantic_similarity")?;
        self.longest_common.validate("longest_common")?;
        self.confidence_weighted.validate("confidence_weighted")?;
        check_fraction("consensus.dissent_similarity", self.dissent_similarity)?;
        if self.embedding_dimensions == 0 {
            return Err(ConfigError::Validation(
                "consensus.embedding_dimensions must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_majority_thresholds() -> MethodThresholds {
    MethodThresholds::new(0.5, 0.5)
}
fn default_weighted_thresholds() -> MethodThresholds {
    MethodThresholds::new(0.7, 0.7)
}
fn default_semantic_thresholds() -> MethodThresholds {
    MethodThresholds::new(0.7, 0.6)
}
fn default_longest_common_thresholds() -> MethodThresholds {
    MethodThresholds::new(0.3, 0.3)
}
fn default_dissent_similarity() -> f64 {
    0.7
}
fn default_embedding_dimensions() -> usize {
    256
}

/// Spend ceilings in USD. Unset limits are not checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub daily_limit: Option<f64>,
    #[serde(default)]
    pub weekly_limit: Option<f64>,
    #[serde(default)]
    pub monthly_limit: Option<f64>,
    #[serde(default)]
    pub per_request_limit: Option<f64>,
    /// Fraction of a window limit at which an alert fires.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    /// Refuse to dispatch when a limit is already exhausted.
    #[serde(default)]
    pub hard_stop: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit: None,
            weekly_limit: None,
            monthly_limit: None,
            per_request_limit: None,
            alert_threshold: default_alert_threshold(),
            hard_stop: false,
        }
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_non_negative("budget.daily_limit", self.daily_limit)?;
        check_non_negative("budget.weekly_limit", self.weekly_limit)?;
        check_non_negative("budget.monthly_limit", self.monthly_limit)?;
        check_non_negative("budget.per_request_limit", self.per_request_limit)?;
        if !(self.alert_threshold > 0.0 && self.alert_threshold <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "budget.alert_threshold must be within (0, 1], got {}",
                self.alert_threshold
            )));
        }
        Ok(())
    }
}

fn default_alert_threshold() -> f64 {
    0.8
}

// ---------------------------------------------------------------------------
// Credential provider — reads secrets from environment at runtime
// ---------------------------------------------------------------------------

/// Resolves credentials from environment variables on demand.
///
/// Config stores env var *names*; this provider turns them into values.
pub struct CredentialProvider;

impl CredentialProvider {
    /// Read a credential from a named env var. Empty values count as unset.
    pub fn from_env(var_name: &str) -> Option<String> {
        std::env::var(var_name).ok().filter(|v| !v.trim().is_empty())
    }

    /// API key for `provider` according to `providers`.
    pub fn api_key(provider: ProviderKind, providers: &ProvidersConfig) -> Option<String> {
        providers.key_env_for(provider).and_then(Self::from_env)
    }

    /// Which remote providers have credentials available.
    pub fn available_providers(providers: &ProvidersConfig) -> Vec<ProviderKind> {
        [
            ProviderKind::Anthropic,
            ProviderKind::OpenAi,
            ProviderKind::Google,
        ]
        .into_iter()
        .filter(|p| Self::api_key(*p, providers).is_some())
        .collect()
    }
}
