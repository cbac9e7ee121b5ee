//! Backend descriptors and the catalog the router and client share.
//!
//! A backend is one vendor model reachable through one provider adapter.
//! The catalog is built once from configuration and shared behind an `Arc`;
//! it is never mutated after construction.

use std::time::Duration;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use td_core::config::{BackendConfig, TandemConfig};
use td_core::{ProviderKind, SpeedClass, TaskCategory};

pub const CLAUDE_SONNET: &str = "claude-sonnet-4";
pub const GPT_4O: &str = "gpt-4o";
pub const GEMINI_PRO: &str = "gemini-1.5-pro";

// ---------------------------------------------------------------------------
// BackendInfo
// ---------------------------------------------------------------------------

/// Static capabilities and pricing for one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub id: String,
    pub provider: ProviderKind,
    /// Model name sent to the vendor API.
    pub model: String,
    pub context_window: u64,
    pub max_output_tokens: u32,
    /// USD per 1K input tokens.
    pub input_price_per_1k: f64,
    /// USD per 1K output tokens.
    pub output_price_per_1k: f64,
    pub speed: SpeedClass,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub recommended_tasks: Vec<TaskCategory>,
    pub timeout_secs: Option<u64>,
    pub base_url: Option<String>,
}

impl BackendInfo {
    pub fn from_config(cfg: &BackendConfig) -> Self {
        Self {
            id: cfg.id.trim().to_string(),
            provider: cfg.provider,
            model: cfg.model.clone().unwrap_or_else(|| cfg.id.trim().to_string()),
            context_window: cfg.context_window,
            max_output_tokens: cfg.max_output_tokens,
            input_price_per_1k: cfg.input_price_per_1k,
            output_price_per_1k: cfg.output_price_per_1k,
            speed: cfg.speed,
            strengths: cfg.strengths.clone(),
            weaknesses: cfg.weaknesses.clone(),
            recommended_tasks: cfg.recommended_tasks.clone(),
            timeout_secs: cfg.timeout_secs,
            base_url: cfg.base_url.clone(),
        }
    }

    /// `input_price × input/1000 + output_price × output/1000`.
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        self.input_price_per_1k * input_tokens as f64 / 1000.0
            + self.output_price_per_1k * output_tokens as f64 / 1000.0
    }

    /// Rough wall-clock estimate from the speed class.
    pub fn estimate_latency_ms(&self, output_tokens: u64) -> u64 {
        self.speed.base_latency_ms() + self.speed.ms_per_output_token() * output_tokens
    }

    /// Combined per-1K price used to rank backends by cheapness.
    pub fn blended_price(&self) -> f64 {
        self.input_price_per_1k + self.output_price_per_1k
    }

    /// Per-call timeout, falling back to `default`.
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(default)
    }
}

/// The three backends every deployment starts with.
pub fn builtin_backends() -> Vec<BackendInfo> {
    vec![
        BackendInfo {
            id: CLAUDE_SONNET.into(),
            provider: ProviderKind::Anthropic,
            model: "claude-sonnet-4-20250514".into(),
            context_window: 200_000,
            max_output_tokens: 8192,
            input_price_per_1k: 0.003,
            output_price_per_1k: 0.015,
            speed: SpeedClass::Medium,
            strengths: vec![
                "complex reasoning".into(),
                "technical writing".into(),
                "code".into(),
            ],
            weaknesses: vec!["price".into()],
            recommended_tasks: vec![
                TaskCategory::Technical,
                TaskCategory::Strategic,
                TaskCategory::Analytical,
                TaskCategory::Extraction,
            ],
            timeout_secs: None,
            base_url: None,
        },
        BackendInfo {
            id: GPT_4O.into(),
            provider: ProviderKind::OpenAi,
            model: "gpt-4o".into(),
            context_window: 128_000,
            max_output_tokens: 4096,
            input_price_per_1k: 0.0025,
            output_price_per_1k: 0.01,
            speed: SpeedClass::Fast,
            strengths: vec!["creative writing".into(), "general knowledge".into()],
            weaknesses: vec!["long documents".into()],
            recommended_tasks: vec![TaskCategory::Creative, TaskCategory::Mixed],
            timeout_secs: None,
            base_url: None,
        },
        BackendInfo {
            id: GEMINI_PRO.into(),
            provider: ProviderKind::Google,
            model: "gemini-1.5-pro".into(),
            context_window: 1_000_000,
            max_output_tokens: 8192,
            input_price_per_1k: 0.00125,
            output_price_per_1k: 0.005,
            speed: SpeedClass::Medium,
            strengths: vec!["long context".into(), "low cost".into()],
            weaknesses: vec!["nuanced reasoning".into()],
            recommended_tasks: vec![TaskCategory::Summarization, TaskCategory::Classification],
            timeout_secs: None,
            base_url: None,
        },
    ]
}

// ---------------------------------------------------------------------------
// BackendCatalog
// ---------------------------------------------------------------------------

/// Ordered, id-indexed set of backends.
#[derive(Debug, Clone, Default)]
pub struct BackendCatalog {
    backends: Vec<BackendInfo>,
    index: AHashMap<String, usize>,
}

impl BackendCatalog {
    /// Build a catalog. A later entry with an id already present replaces the
    /// earlier one in place.
    pub fn new(backends: impl IntoIterator<Item = BackendInfo>) -> Self {
        let mut catalog = Self::default();
        for backend in backends {
            catalog.upsert(backend);
        }
        catalog
    }

    /// Built-ins (unless disabled) overlaid with `[[backends]]` entries.
    pub fn from_config(config: &TandemConfig) -> Self {
        let mut catalog = if config.general.include_builtin_backends {
            Self::new(builtin_backends())
        } else {
            Self::default()
        };
        for entry in &config.backends {
            catalog.upsert(BackendInfo::from_config(entry));
        }
        catalog
    }

    fn upsert(&mut self, backend: BackendInfo) {
        match self.index.get(&backend.id) {
            Some(&i) => self.backends[i] = backend,
            None => {
                self.index.insert(backend.id.clone(), self.backends.len());
                self.backends.push(backend);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&BackendInfo> {
        self.index.get(id).map(|&i| &self.backends[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendInfo> {
        self.backends.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Cheapest backend overall, first-listed on equal price.
    pub fn cheapest(&self) -> Option<&BackendInfo> {
        self.backends.iter().fold(None, |best: Option<&BackendInfo>, b| match best {
            Some(cur) if cur.blended_price() <= b.blended_price() => Some(cur),
            _ => Some(b),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_has_three_backends() {
        let catalog = BackendCatalog::new(builtin_backends());
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.ids(), vec![CLAUDE_SONNET, GPT_4O, GEMINI_PRO]);
        assert_eq!(catalog.cheapest().map(|b| b.id.as_str()), Some(GEMINI_PRO));
    }

    #[test]
    fn estimate_cost_uses_per_1k_prices() {
        let catalog = BackendCatalog::new(builtin_backends());
        let claude = catalog.get(CLAUDE_SONNET).unwrap();
        let cost = claude.estimate_cost(1000, 2000);
        assert!((cost - (0.003 + 0.030)).abs() < 1e-12);
        assert_eq!(claude.estimate_cost(0, 0), 0.0);
    }

    #[test]
    fn config_entries_override_builtins_in_place() {
        let toml = r#"
[[backends]]
id = "gpt-4o"
provider = "open_ai"
input_price_per_1k = 0.001
output_price_per_1k = 0.002
speed = "fast"

[[backends]]
id = "llama-3-70b"
provider = "local"
model = "llama3:70b"
input_price_per_1k = 0.0
output_price_per_1k = 0.0
speed = "slow"
timeout_secs = 120
"#;
        let cfg = TandemConfig::from_toml(toml).unwrap();
        let catalog = BackendCatalog::from_config(&cfg);
        assert_eq!(catalog.len(), 4);
        assert_eq!(catalog.ids()[1], GPT_4O);
        assert!((catalog.get(GPT_4O).unwrap().input_price_per_1k - 0.001).abs() < 1e-12);

        let local = catalog.get("llama-3-70b").unwrap();
        assert_eq!(local.model, "llama3:70b");
        assert_eq!(local.timeout(Duration::from_secs(30)), Duration::from_secs(120));
        assert_eq!(catalog.cheapest().map(|b| b.id.as_str()), Some("llama-3-70b"));
    }

    #[test]
    fn builtins_can_be_disabled() {
        let mut cfg = TandemConfig::default();
        cfg.general.include_builtin_backends = false;
        assert!(BackendCatalog::from_config(&cfg).is_empty());
    }

    #[test]
    fn latency_estimate_grows_with_output() {
        let catalog = BackendCatalog::new(builtin_backends());
        let gpt = catalog.get(GPT_4O).unwrap();
        assert_eq!(gpt.estimate_latency_ms(0), 500);
        assert_eq!(gpt.estimate_latency_ms(100), 1500);
    }
}
