//! Task classification and backend routing.
//!
//! Routes a prompt to the most appropriate backend based on:
//! - Task category (keyword table, with structural fallbacks)
//! - Task complexity (prompt size)
//! - Caller preferences (cheap, fast)
//! - A per-request cost ceiling
//!
//! Classification is a pure function over a [`KeywordTable`]; the routing
//! table and ceiling sit behind a lock so they can be hot-reloaded.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use td_core::config::{ConfigError, RouteRuleConfig, RoutingConfig};
use td_core::TaskCategory;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::backends::{BackendCatalog, BackendInfo, CLAUDE_SONNET, GEMINI_PRO, GPT_4O};
use crate::client::{estimate_tokens_with_ratio, DEFAULT_CHARS_PER_TOKEN};

/// Prompts shorter than this (in chars) count as short for the question
/// heuristic.
const SHORT_PROMPT_CHARS: usize = 100;

/// Leading verbs that mark a prompt as a creation request.
const CREATION_VERBS: &[&str] = &[
    "write", "create", "compose", "draft", "generate", "design", "imagine", "invent",
];

// ---------------------------------------------------------------------------
// Keyword table
// ---------------------------------------------------------------------------

/// Category → indicator terms. Terms are matched as lower-case substrings.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordTable {
    entries: Vec<(TaskCategory, Vec<String>)>,
}

impl KeywordTable {
    pub fn new(entries: Vec<(TaskCategory, Vec<String>)>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(c, terms)| (c, terms.into_iter().map(|t| t.to_lowercase()).collect()))
            .collect();
        Self { entries }
    }

    pub fn terms(&self, category: TaskCategory) -> &[String] {
        self.entries
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, t)| t.as_slice())
            .unwrap_or(&[])
    }

    pub fn entries(&self) -> &[(TaskCategory, Vec<String>)] {
        &self.entries
    }
}

impl Default for KeywordTable {
    fn default() -> Self {
        let table: [(TaskCategory, &[&str]); 7] = [
            (
                TaskCategory::Technical,
                &[
                    "code", "debug", "function", "bug", "compile", "algorithm", "database", "sql",
                    "endpoint", "stack trace", "exception", "refactor", "implement", "python",
                    "javascript", "typescript", "deploy",
                ],
            ),
            (
                TaskCategory::Strategic,
                &[
                    "strategy", "strategic", "roadmap", "business plan", "long-term", "market",
                    "competitive", "prioritize", "growth", "initiative", "stakeholder",
                ],
            ),
            (
                TaskCategory::Analytical,
                &[
                    "analyze", "analysis", "compare", "evaluate", "assess", "trend", "metric",
                    "statistic", "correlation", "pros and cons", "calculate", "forecast",
                ],
            ),
            (
                TaskCategory::Creative,
                &[
                    "poem", "short story", "story about", "creative", "slogan", "tagline",
                    "brainstorm", "fiction", "character", "narrative", "lyrics",
                ],
            ),
            (
                TaskCategory::Classification,
                &[
                    "classify", "categorize", "category", "label", "sentiment", "which type",
                    "sort into", "yes or no", "spam",
                ],
            ),
            (
                TaskCategory::Summarization,
                &[
                    "summarize", "summary", "tl;dr", "tldr", "key points", "condense",
                    "brief overview", "recap", "main points",
                ],
            ),
            (
                TaskCategory::Extraction,
                &[
                    "extract", "parse", "pull out", "find all", "list all", "entities", "fields",
                    "json", "email addresses", "phone numbers",
                ],
            ),
        ];
        Self::new(
            table
                .iter()
                .map(|(c, terms)| (*c, terms.iter().map(|t| t.to_string()).collect()))
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskClassification {
    pub category: TaskCategory,
    /// `min(matched_terms / 5, 1.0)`.
    pub confidence: f64,
    pub matched_terms: Vec<String>,
}

/// Classify `prompt` against `table`.
///
/// The unique highest-scoring category wins. Ties and zero scores fall back
/// to structure: a short question is a classification, a leading creation
/// verb is creative, anything else is mixed. On fallback the matched terms
/// of every tied category are reported.
pub fn classify_with(table: &KeywordTable, prompt: &str) -> TaskClassification {
    let lowered = prompt.to_lowercase();

    let scored: Vec<(TaskCategory, Vec<String>)> = table
        .entries()
        .iter()
        .map(|(category, terms)| {
            let hits = terms
                .iter()
                .filter(|t| lowered.contains(t.as_str()))
                .cloned()
                .collect();
            (*category, hits)
        })
        .collect();

    let top = scored.iter().map(|(_, h)| h.len()).max().unwrap_or(0);
    let leaders: Vec<&(TaskCategory, Vec<String>)> =
        scored.iter().filter(|(_, h)| top > 0 && h.len() == top).collect();

    let (category, matched_terms) = if leaders.len() == 1 {
        (leaders[0].0, leaders[0].1.clone())
    } else {
        let matched: Vec<String> = leaders.iter().flat_map(|(_, h)| h.iter().cloned()).collect();
        (structural_fallback(prompt), matched)
    };

    TaskClassification {
        category,
        confidence: (matched_terms.len() as f64 / 5.0).min(1.0),
        matched_terms,
    }
}

fn structural_fallback(prompt: &str) -> TaskCategory {
    let trimmed = prompt.trim();
    if trimmed.contains('?') && trimmed.chars().count() < SHORT_PROMPT_CHARS {
        return TaskCategory::Classification;
    }
    let first_word = trimmed
        .split_whitespace()
        .next()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .unwrap_or_default();
    if CREATION_VERBS.contains(&first_word.as_str()) {
        TaskCategory::Creative
    } else {
        TaskCategory::Mixed
    }
}

// ---------------------------------------------------------------------------
// Task Complexity Estimate
// ---------------------------------------------------------------------------

/// Estimated complexity for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Trivial,
    Simple,
    Moderate,
    Complex,
    Expert,
}

impl ComplexityLevel {
    pub fn is_simple(&self) -> bool {
        matches!(self, Self::Trivial | Self::Simple)
    }
}

/// Estimate complexity from total prompt size.
pub fn estimate_complexity(prompt: &str, system: Option<&str>) -> ComplexityLevel {
    let total_chars = prompt.chars().count() + system.map(|s| s.chars().count()).unwrap_or(0);
    if total_chars < 100 {
        ComplexityLevel::Trivial
    } else if total_chars < 500 {
        ComplexityLevel::Simple
    } else if total_chars < 2000 {
        ComplexityLevel::Moderate
    } else if total_chars < 8000 {
        ComplexityLevel::Complex
    } else {
        ComplexityLevel::Expert
    }
}

/// Typical answer length per category, in tokens.
fn expected_output_tokens(category: TaskCategory) -> u64 {
    match category {
        TaskCategory::Classification => 50,
        TaskCategory::Extraction | TaskCategory::Summarization => 300,
        TaskCategory::Mixed => 500,
        TaskCategory::Creative | TaskCategory::Analytical => 800,
        TaskCategory::Technical | TaskCategory::Strategic => 1000,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAnalysis {
    pub classification: TaskClassification,
    pub complexity: ComplexityLevel,
    pub estimated_input_tokens: u64,
    pub estimated_output_tokens: u64,
}

// ---------------------------------------------------------------------------
// Routing table
// ---------------------------------------------------------------------------

/// Category → primary + ordered fallbacks. Every category has two
/// fallbacks.
pub fn default_route_table() -> BTreeMap<TaskCategory, RouteRuleConfig> {
    let rule = |primary: &str, fallbacks: [&str; 2]| RouteRuleConfig {
        primary: primary.to_string(),
        fallbacks: fallbacks.iter().map(|s| s.to_string()).collect(),
    };
    let mut table = BTreeMap::new();
    for category in [
        TaskCategory::Technical,
        TaskCategory::Extraction,
        TaskCategory::Strategic,
    ] {
        table.insert(category, rule(CLAUDE_SONNET, [GPT_4O, GEMINI_PRO]));
    }
    table.insert(TaskCategory::Analytical, rule(CLAUDE_SONNET, [GEMINI_PRO, GPT_4O]));
    for category in [TaskCategory::Creative, TaskCategory::Mixed] {
        table.insert(category, rule(GPT_4O, [CLAUDE_SONNET, GEMINI_PRO]));
    }
    for category in [TaskCategory::Summarization, TaskCategory::Classification] {
        table.insert(category, rule(GEMINI_PRO, [GPT_4O, CLAUDE_SONNET]));
    }
    table
}

/// Mutable routing settings, swapped as a whole on reload.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingSettings {
    pub table: BTreeMap<TaskCategory, RouteRuleConfig>,
    pub max_cost_per_request: Option<f64>,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            table: default_route_table(),
            max_cost_per_request: None,
        }
    }
}

impl RoutingSettings {
    /// Default table overlaid with configured rules.
    pub fn from_config(cfg: &RoutingConfig) -> Result<Self, ConfigError> {
        let mut table = default_route_table();
        for (category, rule) in cfg.parsed_rules()? {
            table.insert(category, rule);
        }
        Ok(Self {
            table,
            max_cost_per_request: cfg.max_cost_per_request,
        })
    }
}

// ---------------------------------------------------------------------------
// Route Decision
// ---------------------------------------------------------------------------

/// Caller-supplied routing hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingPreferences {
    #[serde(default)]
    pub prefer_cheap: bool,
    #[serde(default)]
    pub prefer_fast: bool,
    /// Overrides the configured per-request ceiling.
    #[serde(default)]
    pub max_cost: Option<f64>,
    /// Caps the expected output used for cost and latency estimates.
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
}

/// The result of a routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub primary: String,
    /// Never contains the primary or a backend twice.
    pub fallbacks: Vec<String>,
    pub task_type: TaskCategory,
    pub complexity: ComplexityLevel,
    /// USD, for the primary.
    pub estimated_cost: f64,
    pub estimated_latency_ms: u64,
    pub confidence: f64,
    pub rationale: String,
}

impl RoutingDecision {
    /// Primary followed by fallbacks.
    pub fn ordered(&self) -> Vec<String> {
        std::iter::once(self.primary.clone())
            .chain(self.fallbacks.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouterError {
    #[error("no backends available to route to")]
    NoBackends,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Routes prompts to backends in a fixed catalog.
#[derive(Clone)]
pub struct Router {
    catalog: Arc<BackendCatalog>,
    keywords: Arc<KeywordTable>,
    settings: Arc<RwLock<RoutingSettings>>,
}

impl Router {
    pub fn new(catalog: Arc<BackendCatalog>, settings: RoutingSettings) -> Self {
        Self {
            catalog,
            keywords: Arc::new(KeywordTable::default()),
            settings: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn with_keywords(mut self, keywords: KeywordTable) -> Self {
        self.keywords = Arc::new(keywords);
        self
    }

    pub fn catalog(&self) -> &Arc<BackendCatalog> {
        &self.catalog
    }

    /// Replace the routing settings atomically.
    pub async fn reload(&self, settings: RoutingSettings) {
        *self.settings.write().await = settings;
        tracing::info!("routing settings reloaded");
    }

    pub async fn settings(&self) -> RoutingSettings {
        self.settings.read().await.clone()
    }

    pub fn classify(&self, prompt: &str) -> TaskClassification {
        classify_with(&self.keywords, prompt)
    }

    pub fn analyze(&self, prompt: &str, system: Option<&str>) -> TaskAnalysis {
        let classification = self.classify(prompt);
        let input_text = match system {
            Some(s) => format!("{s}\n{prompt}"),
            None => prompt.to_string(),
        };
        TaskAnalysis {
            estimated_output_tokens: expected_output_tokens(classification.category),
            estimated_input_tokens: estimate_tokens_with_ratio(&input_text, DEFAULT_CHARS_PER_TOKEN),
            complexity: estimate_complexity(prompt, system),
            classification,
        }
    }

    pub async fn route(
        &self,
        prompt: &str,
        system: Option<&str>,
        preferences: &RoutingPreferences,
    ) -> Result<RoutingDecision, RouterError> {
        let analysis = self.analyze(prompt, system);
        self.route_analyzed(&analysis, preferences).await
    }

    /// Route with the category forced, e.g. from a caller-supplied task type.
    pub async fn route_as(
        &self,
        category: TaskCategory,
        prompt: &str,
        system: Option<&str>,
        preferences: &RoutingPreferences,
    ) -> Result<RoutingDecision, RouterError> {
        let mut analysis = self.analyze(prompt, system);
        if analysis.classification.category != category {
            analysis.classification = TaskClassification {
                category,
                confidence: 1.0,
                matched_terms: Vec::new(),
            };
            analysis.estimated_output_tokens = expected_output_tokens(category);
        }
        self.route_analyzed(&analysis, preferences).await
    }

    async fn route_analyzed(
        &self,
        analysis: &TaskAnalysis,
        preferences: &RoutingPreferences,
    ) -> Result<RoutingDecision, RouterError> {
        let settings = self.settings.read().await.clone();
        let category = analysis.classification.category;
        let mut rationale = vec![format!(
            "classified as {category} ({:.0}% confidence, {:?} complexity)",
            analysis.classification.confidence * 100.0,
            analysis.complexity
        )];

        let mut order = self.candidates(&settings, category);
        if order.is_empty() {
            order = self.catalog.ids();
            if order.is_empty() {
                return Err(RouterError::NoBackends);
            }
            rationale.push("no routed backend is available, using catalog order".into());
        }

        if preferences.prefer_cheap && analysis.complexity.is_simple() {
            if let Some(cheapest) = self.catalog.cheapest() {
                if cheapest.id != order[0] {
                    let id = cheapest.id.clone();
                    order.retain(|b| *b != id);
                    order.insert(0, id.clone());
                    rationale.push(format!("prefer_cheap: promoted {id} for a simple task"));
                }
            }
        }

        if preferences.prefer_fast {
            let fastest = order
                .iter()
                .enumerate()
                .filter_map(|(i, id)| self.catalog.get(id).map(|b| (i, b.speed)))
                .min_by_key(|(i, speed)| (*speed, *i))
                .map(|(i, _)| i);
            if let Some(i) = fastest.filter(|i| *i > 0) {
                let id = order.remove(i);
                rationale.push(format!("prefer_fast: promoted {id}"));
                order.insert(0, id);
            }
        }

        let output_tokens = preferences
            .max_output_tokens
            .map_or(analysis.estimated_output_tokens, |cap| {
                analysis.estimated_output_tokens.min(u64::from(cap))
            });
        let cost_of =
            |b: &BackendInfo| b.estimate_cost(analysis.estimated_input_tokens, output_tokens);

        let ceiling = preferences.max_cost.or(settings.max_cost_per_request);
        if let Some(ceiling) = ceiling {
            let primary_cost = self.catalog.get(&order[0]).map(cost_of).unwrap_or(0.0);
            if primary_cost > ceiling {
                let fit = order
                    .iter()
                    .filter_map(|id| self.catalog.get(id))
                    .map(|b| (b.id.clone(), cost_of(b)))
                    .filter(|(_, cost)| *cost <= ceiling)
                    .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                match fit {
                    Some((id, cost)) => {
                        order.retain(|b| *b != id);
                        order.insert(0, id.clone());
                        rationale.push(format!(
                            "cost ceiling ${ceiling:.4}: promoted {id} (est ${cost:.4})"
                        ));
                    }
                    None => rationale.push(format!(
                        "cost ceiling ${ceiling:.4}: no backend fits, keeping {} (est ${primary_cost:.4})",
                        order[0]
                    )),
                }
            }
        }

        let primary = order.remove(0);
        let (estimated_cost, estimated_latency_ms) = self
            .catalog
            .get(&primary)
            .map(|b| (cost_of(b), b.estimate_latency_ms(output_tokens)))
            .unwrap_or((0.0, 0));
        rationale.push(format!("primary {primary}"));

        let decision = RoutingDecision {
            primary,
            fallbacks: order,
            task_type: category,
            complexity: analysis.complexity,
            estimated_cost,
            estimated_latency_ms,
            confidence: analysis.classification.confidence,
            rationale: rationale.join("; "),
        };
        tracing::debug!(
            primary = %decision.primary,
            fallbacks = ?decision.fallbacks,
            estimated_cost = decision.estimated_cost,
            "routed"
        );
        Ok(decision)
    }

    /// Rule backends present in the catalog, primary first, deduplicated.
    fn candidates(&self, settings: &RoutingSettings, category: TaskCategory) -> Vec<String> {
        let rule = settings
            .table
            .get(&category)
            .or_else(|| settings.table.get(&TaskCategory::Mixed));
        let mut order: Vec<String> = Vec::new();
        if let Some(rule) = rule {
            for id in std::iter::once(&rule.primary).chain(rule.fallbacks.iter()) {
                if self.catalog.contains(id) && !order.contains(id) {
                    order.push(id.clone());
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::builtin_backends;

    fn router() -> Router {
        Router::new(
            Arc::new(BackendCatalog::new(builtin_backends())),
            RoutingSettings::default(),
        )
    }

    #[test]
    fn debug_prompt_is_technical() {
        let c = classify_with(&KeywordTable::default(), "Please debug this function for me");
        assert_eq!(c.category, TaskCategory::Technical);
        assert!(c.matched_terms.iter().any(|t| t == "debug"));
        assert!(c.confidence > 0.0);
    }

    #[test]
    fn confidence_saturates_at_five_matches() {
        let c = classify_with(
            &KeywordTable::default(),
            "debug the code, fix the bug, refactor the function and compile the algorithm",
        );
        assert_eq!(c.category, TaskCategory::Technical);
        assert_eq!(c.confidence, 1.0);
    }

    #[test]
    fn short_question_without_keywords_is_classification() {
        let c = classify_with(&KeywordTable::default(), "Is the sky blue?");
        assert_eq!(c.category, TaskCategory::Classification);
        assert_eq!(c.confidence, 0.0);
    }

    #[test]
    fn creation_verb_is_creative() {
        let c = classify_with(&KeywordTable::default(), "Write a welcome note for new hires");
        assert_eq!(c.category, TaskCategory::Creative);
    }

    #[test]
    fn tie_falls_back_to_structure() {
        // one technical term, one summarization term
        let c = classify_with(
            &KeywordTable::default(),
            "Give me a summary of what this sql does, in plain words for the whole team please",
        );
        assert_eq!(c.category, TaskCategory::Mixed);
        assert_eq!(c.matched_terms.len(), 2);
    }

    #[test]
    fn custom_keyword_table() {
        let table = KeywordTable::new(vec![(TaskCategory::Extraction, vec!["INVOICE".into()])]);
        let c = classify_with(&table, "read this invoice");
        assert_eq!(c.category, TaskCategory::Extraction);
        assert_eq!(c.matched_terms, vec!["invoice".to_string()]);
    }

    #[test]
    fn complexity_thresholds() {
        assert_eq!(estimate_complexity("hi", None), ComplexityLevel::Trivial);
        assert_eq!(estimate_complexity(&"x".repeat(300), None), ComplexityLevel::Simple);
        assert_eq!(
            estimate_complexity(&"x".repeat(300), Some(&"y".repeat(300))),
            ComplexityLevel::Moderate
        );
        assert_eq!(estimate_complexity(&"x".repeat(9000), None), ComplexityLevel::Expert);
    }

    #[test]
    fn default_table_has_two_fallbacks_everywhere() {
        let table = default_route_table();
        for category in TaskCategory::ALL {
            let rule = &table[&category];
            assert_eq!(rule.fallbacks.len(), 2, "{category}");
            assert!(!rule.fallbacks.contains(&rule.primary));
        }
    }

    #[tokio::test]
    async fn technical_routes_to_claude() {
        let d = router()
            .route("debug this function", None, &RoutingPreferences::default())
            .await
            .unwrap();
        assert_eq!(d.primary, CLAUDE_SONNET);
        assert_eq!(d.fallbacks, vec![GPT_4O, GEMINI_PRO]);
        assert_eq!(d.task_type, TaskCategory::Technical);
        assert!(d.estimated_cost > 0.0);
        assert!(d.estimated_latency_ms > 0);
    }

    #[tokio::test]
    async fn prefer_cheap_demotes_primary_for_simple_tasks() {
        let prefs = RoutingPreferences {
            prefer_cheap: true,
            ..Default::default()
        };
        let d = router().route("debug this function", None, &prefs).await.unwrap();
        assert_eq!(d.primary, GEMINI_PRO);
        assert_eq!(d.fallbacks, vec![CLAUDE_SONNET, GPT_4O]);
    }

    #[tokio::test]
    async fn prefer_cheap_ignored_for_complex_tasks() {
        let prefs = RoutingPreferences {
            prefer_cheap: true,
            ..Default::default()
        };
        let prompt = format!("debug this function {}", "x".repeat(3000));
        let d = router().route(&prompt, None, &prefs).await.unwrap();
        assert_eq!(d.primary, CLAUDE_SONNET);
    }

    #[tokio::test]
    async fn prefer_fast_promotes_fastest() {
        let prefs = RoutingPreferences {
            prefer_fast: true,
            ..Default::default()
        };
        let d = router().route("debug this function", None, &prefs).await.unwrap();
        assert_eq!(d.primary, GPT_4O);
        assert_eq!(d.fallbacks, vec![CLAUDE_SONNET, GEMINI_PRO]);
    }

    #[tokio::test]
    async fn cost_ceiling_promotes_cheapest_that_fits() {
        let prefs = RoutingPreferences {
            max_cost: Some(0.008),
            ..Default::default()
        };
        // technical: ~1000 output tokens; claude ≈ $0.015, gpt-4o ≈ $0.010, gemini ≈ $0.005
        let d = router().route("debug this function", None, &prefs).await.unwrap();
        assert_eq!(d.primary, GEMINI_PRO);
        assert!(d.estimated_cost <= 0.008);
        assert!(d.rationale.contains("cost ceiling"));
        assert!(!d.fallbacks.contains(&d.primary));
    }

    #[tokio::test]
    async fn output_cap_lowers_estimate() {
        let uncapped = router()
            .route("debug this function", None, &RoutingPreferences::default())
            .await
            .unwrap();
        let prefs = RoutingPreferences {
            max_output_tokens: Some(100),
            ..Default::default()
        };
        let capped = router().route("debug this function", None, &prefs).await.unwrap();
        assert_eq!(capped.primary, uncapped.primary);
        assert!(capped.estimated_cost < uncapped.estimated_cost);
        assert!(capped.estimated_latency_ms < uncapped.estimated_latency_ms);

        // a ceiling the capped estimate fits no longer reorders
        let prefs = RoutingPreferences {
            max_cost: Some(0.008),
            max_output_tokens: Some(100),
            ..Default::default()
        };
        let d = router().route("debug this function", None, &prefs).await.unwrap();
        assert_eq!(d.primary, CLAUDE_SONNET);
    }

    #[tokio::test]
    async fn cost_ceiling_nothing_fits_keeps_decision() {
        let prefs = RoutingPreferences {
            max_cost: Some(0.000001),
            ..Default::default()
        };
        let d = router().route("debug this function", None, &prefs).await.unwrap();
        assert_eq!(d.primary, CLAUDE_SONNET);
        assert!(d.rationale.contains("no backend fits"));
    }

    #[tokio::test]
    async fn unknown_rule_backends_are_skipped() {
        let mut settings = RoutingSettings::default();
        settings.table.insert(
            TaskCategory::Technical,
            RouteRuleConfig {
                primary: "not-configured".into(),
                fallbacks: vec![GEMINI_PRO.into()],
            },
        );
        let r = router();
        r.reload(settings).await;
        let d = r
            .route("debug this function", None, &RoutingPreferences::default())
            .await
            .unwrap();
        assert_eq!(d.primary, GEMINI_PRO);
        assert!(d.fallbacks.is_empty());
    }

    #[tokio::test]
    async fn empty_catalog_is_an_error() {
        let r = Router::new(Arc::new(BackendCatalog::default()), RoutingSettings::default());
        assert_eq!(
            r.route("hi", None, &RoutingPreferences::default()).await,
            Err(RouterError::NoBackends)
        );
    }

    #[tokio::test]
    async fn route_as_overrides_category() {
        let d = router()
            .route_as(
                TaskCategory::Summarization,
                "debug this function",
                None,
                &RoutingPreferences::default(),
            )
            .await
            .unwrap();
        assert_eq!(d.task_type, TaskCategory::Summarization);
        assert_eq!(d.primary, GEMINI_PRO);
    }
}
