//! Consensus engine: reconcile several backend responses into one answer.
//!
//! Methods are deliberately simple and explainable: exact-match voting,
//! cost-weighted numeric averaging, embedding similarity and shared-sentence
//! extraction. Every result carries an agreement score, the dissenting
//! backends and a review flag derived from per-method thresholds.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use td_core::config::{ConsensusConfig, MethodThresholds};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::embedding::{cosine_similarity, Embedder, LexicalEmbedder};
use crate::llm::LlmResponse;

/// Added to cost before inverting it into a weight.
pub const WEIGHT_EPSILON: f64 = 1e-6;
/// Confidence reported for a lone response.
pub const SINGLE_RESPONSE_CONFIDENCE: f64 = 0.7;
/// Confidence when no response carries a number.
pub const NO_NUMERIC_CONFIDENCE: f64 = 0.3;
/// Agreement floor when the longest-common method keeps nothing.
pub const LONGEST_COMMON_FLOOR: f64 = 0.1;
/// Average response length (chars) under which majority vote is chosen.
pub const SHORT_ANSWER_CHARS: f64 = 50.0;
/// Sentences shorter than this are ignored by longest-common.
const MIN_SENTENCE_CHARS: usize = 10;

fn number_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").ok()).as_ref()
}

/// First numeric token in `text`.
pub fn first_number(text: &str) -> Option<f64> {
    number_pattern()?
        .find(text)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMethod {
    /// Only one response was available.
    Single,
    MajorityVote,
    WeightedAverage,
    SemanticSimilarity,
    LongestCommon,
    /// Cost-derived weights reported, decision delegated to semantic
    /// similarity. The weights do not change the outcome.
    ConfidenceWeighted,
}

impl ConsensusMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::MajorityVote => "majority_vote",
            Self::WeightedAverage => "weighted_average",
            Self::SemanticSimilarity => "semantic_similarity",
            Self::LongestCommon => "longest_common",
            Self::ConfidenceWeighted => "confidence_weighted",
        }
    }

    fn thresholds(&self, cfg: &ConsensusConfig) -> Option<MethodThresholds> {
        match self {
            Self::Single => None,
            Self::MajorityVote => Some(cfg.majority_vote),
            Self::WeightedAverage => Some(cfg.weighted_average),
            Self::SemanticSimilarity => Some(cfg.semantic_similarity),
            Self::LongestCommon => Some(cfg.longest_common),
            Self::ConfidenceWeighted => Some(cfg.confidence_weighted),
        }
    }
}

impl fmt::Display for ConsensusMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend whose answer disagreed with the consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dissent {
    pub backend: String,
    pub reason: String,
}

/// Machine-readable reasons a result may need review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsensusWarning {
    LowAgreement { agreement: f64, threshold: f64 },
    LowConfidence { confidence: f64, threshold: f64 },
    Dissent { backend: String, reason: String },
    ForcedReview,
    /// The configured embedder failed; the lexical embedder was used.
    EmbeddingFallback { embedder: String, error: String },
    /// No response contained a number; the first was returned as is.
    NoNumericValues,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub method: ConsensusMethod,
    pub content: String,
    /// Set by the weighted-average method.
    pub value: Option<f64>,
    pub confidence: f64,
    pub agreement: f64,
    pub dissents: Vec<Dissent>,
    pub requires_review: bool,
    pub warnings: Vec<ConsensusWarning>,
    /// Backends that contributed, in response order.
    pub backends: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConsensusError {
    #[error("consensus requires at least one response")]
    NoResponses,
}

/// Choose a method from the response shape: short answers vote, answers
/// that all carry numbers are averaged, everything else is compared
/// semantically.
pub fn select_method(responses: &[LlmResponse]) -> ConsensusMethod {
    if responses.len() <= 1 {
        return ConsensusMethod::Single;
    }
    let avg_len = responses
        .iter()
        .map(|r| r.content.chars().count() as f64)
        .sum::<f64>()
        / responses.len() as f64;
    if avg_len < SHORT_ANSWER_CHARS {
        ConsensusMethod::MajorityVote
    } else if responses.iter().all(|r| first_number(&r.content).is_some()) {
        ConsensusMethod::WeightedAverage
    } else {
        ConsensusMethod::SemanticSimilarity
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Partial result before validation.
struct Draft {
    content: String,
    value: Option<f64>,
    confidence: f64,
    agreement: f64,
    dissents: Vec<Dissent>,
    warnings: Vec<ConsensusWarning>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl Draft {
    fn new(content: String, agreement: f64, confidence: f64) -> Self {
        Self {
            content,
            value: None,
            confidence,
            agreement,
            dissents: Vec::new(),
            warnings: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

pub struct ConsensusEngine {
    config: RwLock<ConsensusConfig>,
    embedder: Arc<dyn Embedder>,
    lexical: LexicalEmbedder,
}

impl ConsensusEngine {
    /// Engine using the offline lexical embedder.
    pub fn new(config: ConsensusConfig) -> Self {
        let lexical = LexicalEmbedder::new(config.embedding_dimensions);
        Self {
            embedder: Arc::new(lexical.clone()),
            lexical,
            config: RwLock::new(config),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Swap thresholds atomically.
    pub async fn reload(&self, config: ConsensusConfig) {
        *self.config.write().await = config;
    }

    pub async fn config(&self) -> ConsensusConfig {
        self.config.read().await.clone()
    }

    /// Reconcile `responses`. `None` selects a method from the response
    /// shape.
    pub async fn build(
        &self,
        responses: &[LlmResponse],
        method: Option<ConsensusMethod>,
    ) -> Result<ConsensusResult, ConsensusError> {
        let first = responses.first().ok_or(ConsensusError::NoResponses)?;
        let backends: Vec<String> = responses.iter().map(|r| r.backend.clone()).collect();

        if responses.len() == 1 {
            return Ok(ConsensusResult {
                method: ConsensusMethod::Single,
                content: first.content.clone(),
                value: None,
                confidence: SINGLE_RESPONSE_CONFIDENCE,
                agreement: 1.0,
                dissents: Vec::new(),
                requires_review: false,
                warnings: Vec::new(),
                backends,
                metadata: BTreeMap::new(),
            });
        }

        let config = self.config.read().await.clone();
        let method = match method {
            Some(ConsensusMethod::Single) | None => select_method(responses),
            Some(m) => m,
        };

        let draft = match method {
            // select_method only yields Single for a lone response
            ConsensusMethod::MajorityVote | ConsensusMethod::Single => majority_vote(responses),
            ConsensusMethod::WeightedAverage => weighted_average(responses),
            ConsensusMethod::SemanticSimilarity => self.semantic(responses, &config).await,
            ConsensusMethod::LongestCommon => longest_common(responses),
            ConsensusMethod::ConfidenceWeighted => {
                let mut draft = self.semantic(responses, &config).await;
                draft
                    .metadata
                    .insert("weights".into(), serde_json::json!(cost_weights(responses)));
                draft
            }
        };

        Ok(validate(method, draft, backends, &config))
    }

    async fn semantic(&self, responses: &[LlmResponse], config: &ConsensusConfig) -> Draft {
        let texts: Vec<String> = responses.iter().map(|r| r.content.clone()).collect();
        let mut warnings = Vec::new();
        let vectors = match self.embedder.embed_batch(&texts).await {
            Ok(v) if v.len() == texts.len() => v,
            outcome => {
                let error = match outcome {
                    Err(e) => e.to_string(),
                    Ok(v) => format!("expected {} vectors, got {}", texts.len(), v.len()),
                };
                warn!(embedder = self.embedder.name(), %error, "embedding failed, using lexical embedder");
                warnings.push(ConsensusWarning::EmbeddingFallback {
                    embedder: self.embedder.name().to_string(),
                    error,
                });
                texts.iter().map(|t| self.lexical.embed(t)).collect()
            }
        };

        let mut draft = semantic_from_vectors(responses, &vectors, config.dissent_similarity);
        warnings.append(&mut draft.warnings);
        draft.warnings = warnings;
        draft
    }
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

fn majority_vote(responses: &[LlmResponse]) -> Draft {
    // (normalized answer, member indices) in first-occurrence order
    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for (i, r) in responses.iter().enumerate() {
        let key = r.content.trim().to_lowercase();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(i),
            None => groups.push((key, vec![i])),
        }
    }

    let mut winner = 0;
    for (g, (_, members)) in groups.iter().enumerate() {
        if members.len() > groups[winner].1.len() {
            winner = g;
        }
    }
    let members = &groups[winner].1;
    let agreement = members.len() as f64 / responses.len() as f64;

    let mut draft = Draft::new(
        responses[members[0]].content.trim().to_string(),
        agreement,
        agreement,
    );
    draft.dissents = responses
        .iter()
        .enumerate()
        .filter(|(i, _)| !members.contains(i))
        .map(|(_, r)| Dissent {
            backend: r.backend.clone(),
            reason: "different classification".into(),
        })
        .collect();
    draft.metadata.insert("groups".into(), serde_json::json!(groups.len()));
    draft
}

/// `1 / (cost + ε)` per response.
fn raw_weight(r: &LlmResponse) -> f64 {
    1.0 / (r.cost.max(0.0) + WEIGHT_EPSILON)
}

/// Normalized cost weights keyed by backend.
fn cost_weights(responses: &[LlmResponse]) -> BTreeMap<String, f64> {
    let total: f64 = responses.iter().map(raw_weight).sum();
    let mut weights = BTreeMap::new();
    for r in responses {
        *weights.entry(r.backend.clone()).or_insert(0.0) += raw_weight(r) / total;
    }
    weights
}

fn format_number(value: f64) -> String {
    if (value - value.round()).abs() < 1e-9 {
        format!("{value:.0}")
    } else {
        let s = format!("{value:.4}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

fn weighted_average(responses: &[LlmResponse]) -> Draft {
    let values: Vec<Option<f64>> = responses.iter().map(|r| first_number(&r.content)).collect();

    let numeric: Vec<(f64, f64)> = responses
        .iter()
        .zip(&values)
        .filter_map(|(r, v)| v.map(|x| (x, raw_weight(r))))
        .collect();

    if numeric.is_empty() {
        let mut draft = Draft::new(responses[0].content.clone(), 0.0, NO_NUMERIC_CONFIDENCE);
        draft.warnings.push(ConsensusWarning::NoNumericValues);
        return draft;
    }

    let total_weight: f64 = numeric.iter().map(|(_, w)| w).sum();
    let mean = numeric.iter().map(|(x, w)| x * w).sum::<f64>() / total_weight;
    let variance = numeric
        .iter()
        .map(|(x, w)| w * (x - mean).powi(2))
        .sum::<f64>()
        / total_weight;
    let std_dev = variance.sqrt();

    let agreement = if mean.abs() < f64::EPSILON {
        if std_dev < f64::EPSILON {
            1.0
        } else {
            0.0
        }
    } else {
        (1.0 - std_dev / mean.abs()).max(0.0)
    };

    let mut draft = Draft::new(format_number(mean), agreement, agreement);
    draft.value = Some(mean);
    draft.dissents = responses
        .iter()
        .zip(&values)
        .filter(|(_, v)| v.is_none())
        .map(|(r, _)| Dissent {
            backend: r.backend.clone(),
            reason: "no numeric value".into(),
        })
        .collect();
    draft
        .metadata
        .insert("std_dev".into(), serde_json::json!(std_dev));
    draft
        .metadata
        .insert("weights".into(), serde_json::json!(cost_weights(responses)));
    draft
}

fn semantic_from_vectors(
    responses: &[LlmResponse],
    vectors: &[Vec<f32>],
    dissent_similarity: f64,
) -> Draft {
    let n = responses.len();
    let mut sims = vec![vec![1.0f64; n]; n];
    let mut pair_total = 0.0;
    let mut pairs = 0usize;
    for i in 0..n {
        for j in (i + 1)..n {
            let s = cosine_similarity(&vectors[i], &vectors[j]);
            sims[i][j] = s;
            sims[j][i] = s;
            pair_total += s;
            pairs += 1;
        }
    }
    let agreement = if pairs == 0 {
        1.0
    } else {
        (pair_total / pairs as f64).clamp(0.0, 1.0)
    };

    let centrality = |i: usize| -> f64 {
        (0..n).filter(|&j| j != i).map(|j| sims[i][j]).sum::<f64>() / (n - 1).max(1) as f64
    };
    let mut central = 0;
    for i in 1..n {
        if centrality(i) > centrality(central) {
            central = i;
        }
    }

    let mut draft = Draft::new(responses[central].content.clone(), agreement, agreement);
    draft.dissents = (0..n)
        .filter(|&i| i != central && sims[i][central] < dissent_similarity)
        .map(|i| Dissent {
            backend: responses[i].backend.clone(),
            reason: "semantically different".into(),
        })
        .collect();
    draft
        .metadata
        .insert("central_backend".into(), serde_json::json!(responses[central].backend));
    draft
}

/// Sentences of `text`, each trimmed and keeping its terminator.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let end = i + c.len_utf8();
            let s = text[start..end].trim();
            if !s.is_empty() {
                sentences.push(s);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn longest_common(responses: &[LlmResponse]) -> Draft {
    let first = &responses[0].content;
    let others = &responses[1..];

    let mut kept: Vec<&str> = Vec::new();
    let mut matched_by = vec![false; others.len()];
    for sentence in split_sentences(first) {
        let body = sentence.trim_end_matches(['.', '!', '?']).trim();
        if body.chars().count() < MIN_SENTENCE_CHARS {
            continue;
        }
        let hits: Vec<usize> = others
            .iter()
            .enumerate()
            .filter(|(_, r)| r.content.contains(body))
            .map(|(i, _)| i)
            .collect();
        if hits.len() * 2 >= others.len() {
            kept.push(sentence);
            for i in hits {
                matched_by[i] = true;
            }
        }
    }

    if kept.is_empty() {
        return Draft::new(first.clone(), LONGEST_COMMON_FLOOR, LONGEST_COMMON_FLOOR);
    }

    let content = kept.join(" ");
    let first_len = first.chars().count().max(1);
    let agreement = (content.chars().count() as f64 / first_len as f64).min(1.0);

    let mut draft = Draft::new(content, agreement, agreement);
    draft.dissents = others
        .iter()
        .zip(&matched_by)
        .filter(|(_, matched)| !**matched)
        .map(|(r, _)| Dissent {
            backend: r.backend.clone(),
            reason: "no common sentences".into(),
        })
        .collect();
    draft
        .metadata
        .insert("kept_sentences".into(), serde_json::json!(kept.len()));
    draft
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(
    method: ConsensusMethod,
    draft: Draft,
    backends: Vec<String>,
    config: &ConsensusConfig,
) -> ConsensusResult {
    let mut warnings = draft.warnings;
    let mut review = false;

    if let Some(t) = method.thresholds(config) {
        // NaN compares false against any threshold
        if !draft.agreement.is_finite() || draft.agreement < t.min_agreement {
            review = true;
            warnings.push(ConsensusWarning::LowAgreement {
                agreement: draft.agreement,
                threshold: t.min_agreement,
            });
        }
        if !draft.confidence.is_finite() || draft.confidence < t.min_confidence {
            review = true;
            warnings.push(ConsensusWarning::LowConfidence {
                confidence: draft.confidence,
                threshold: t.min_confidence,
            });
        }
        if t.require_review {
            review = true;
            warnings.push(ConsensusWarning::ForcedReview);
        }
    }
    for d in &draft.dissents {
        review = true;
        warnings.push(ConsensusWarning::Dissent {
            backend: d.backend.clone(),
            reason: d.reason.clone(),
        });
    }

    if review {
        warn!(
            method = %method,
            agreement = draft.agreement,
            confidence = draft.confidence,
            dissents = draft.dissents.len(),
            "consensus requires review"
        );
    } else {
        debug!(method = %method, agreement = draft.agreement, "consensus reached");
    }

    ConsensusResult {
        method,
        content: draft.content,
        value: draft.value,
        confidence: draft.confidence,
        agreement: draft.agreement,
        dissents: draft.dissents,
        requires_review: review,
        warnings,
        backends,
        metadata: draft.metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FinishReason;
    use td_core::ProviderKind;

    fn resp(backend: &str, content: &str, cost: f64) -> LlmResponse {
        LlmResponse {
            backend: backend.into(),
            provider: ProviderKind::Mock,
            content: content.into(),
            finish_reason: FinishReason::Stop,
            input_tokens: 10,
            output_tokens: 10,
            total_tokens: 20,
            cost,
            latency_ms: 5,
            timestamp: chrono::Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    fn engine() -> ConsensusEngine {
        ConsensusEngine::new(ConsensusConfig::default())
    }

    #[test]
    fn number_extraction() {
        assert_eq!(first_number("score: 85/100"), Some(85.0));
        assert_eq!(first_number("about -3.5 degrees"), Some(-3.5));
        assert_eq!(first_number("no digits"), None);
    }

    #[test]
    fn method_selection() {
        let short = vec![resp("a", "yes", 0.0), resp("b", "no", 0.0)];
        assert_eq!(select_method(&short), ConsensusMethod::MajorityVote);

        let numeric = vec![
            resp("a", &format!("The estimated total comes to 120 units {}", "x".repeat(40)), 0.0),
            resp("b", &format!("I would put it at roughly 118 units {}", "x".repeat(40)), 0.0),
        ];
        assert_eq!(select_method(&numeric), ConsensusMethod::WeightedAverage);

        let prose = vec![
            resp("a", &"Ownership rules keep memory safe without a collector. ".repeat(2), 0.0),
            resp("b", &"The borrow checker enforces aliasing rules at compile time. ".repeat(2), 0.0),
        ];
        assert_eq!(select_method(&prose), ConsensusMethod::SemanticSimilarity);
    }

    #[tokio::test]
    async fn empty_input_is_an_error() {
        assert_eq!(engine().build(&[], None).await, Err(ConsensusError::NoResponses));
    }

    #[tokio::test]
    async fn single_response_passes_through() {
        let result = engine()
            .build(&[resp("a", "  verbatim text  ", 0.01)], Some(ConsensusMethod::MajorityVote))
            .await
            .unwrap();
        assert_eq!(result.method, ConsensusMethod::Single);
        assert_eq!(result.content, "  verbatim text  ");
        assert_eq!(result.agreement, 1.0);
        assert_eq!(result.confidence, SINGLE_RESPONSE_CONFIDENCE);
        assert!(!result.requires_review);
    }

    #[tokio::test]
    async fn majority_vote_tie_takes_earliest_group() {
        let responses = vec![
            resp("a", "Spam", 0.0),
            resp("b", "ham", 0.0),
            resp("c", "spam ", 0.0),
            resp("d", "HAM", 0.0),
        ];
        let result = engine()
            .build(&responses, Some(ConsensusMethod::MajorityVote))
            .await
            .unwrap();
        assert_eq!(result.content, "Spam");
        assert_eq!(result.agreement, 0.5);
        assert_eq!(result.dissents.len(), 2);
        assert!(result.requires_review);
    }

    #[tokio::test]
    async fn weighted_average_prefers_cheaper_answers() {
        let responses = vec![resp("cheap", "100", 0.0), resp("pricey", "200", 1.0)];
        let result = engine()
            .build(&responses, Some(ConsensusMethod::WeightedAverage))
            .await
            .unwrap();
        let value = result.value.unwrap();
        assert!(value > 99.0 && value < 101.0, "got {value}");
    }

    #[tokio::test]
    async fn weighted_average_without_numbers() {
        let responses = vec![resp("a", "unknown", 0.0), resp("b", "unclear", 0.0)];
        let result = engine()
            .build(&responses, Some(ConsensusMethod::WeightedAverage))
            .await
            .unwrap();
        assert_eq!(result.content, "unknown");
        assert_eq!(result.confidence, NO_NUMERIC_CONFIDENCE);
        assert!(result.warnings.contains(&ConsensusWarning::NoNumericValues));
        assert!(result.requires_review);
    }

    #[tokio::test]
    async fn semantic_dissent_and_central_choice() {
        let responses = vec![
            resp("a", "The service restarts the worker pool after a config change", 0.0),
            resp("b", "After a config change the service restarts the worker pool", 0.0),
            resp("c", "Bananas are an excellent source of potassium", 0.0),
        ];
        let result = engine()
            .build(&responses, Some(ConsensusMethod::SemanticSimilarity))
            .await
            .unwrap();
        assert!(result.content == responses[0].content || result.content == responses[1].content);
        assert_eq!(result.dissents.len(), 1);
        assert_eq!(result.dissents[0].backend, "c");
        assert!(result.requires_review);
    }

    #[tokio::test]
    async fn longest_common_keeps_shared_sentences() {
        let responses = vec![
            resp("a", "Restart the daemon first. Clear the cache directory. Done!", 0.0),
            resp("b", "Clear the cache directory. Restart the daemon first.", 0.0),
            resp("c", "Restart the daemon first, nothing else.", 0.0),
        ];
        let result = engine()
            .build(&responses, Some(ConsensusMethod::LongestCommon))
            .await
            .unwrap();
        assert_eq!(
            result.content,
            "Restart the daemon first. Clear the cache directory."
        );
        assert!(result.agreement > 0.8);
        assert!(result.dissents.is_empty());
    }

    #[tokio::test]
    async fn longest_common_with_nothing_shared() {
        let responses = vec![
            resp("a", "Completely unrelated answer here.", 0.0),
            resp("b", "Another answer with other words.", 0.0),
        ];
        let result = engine()
            .build(&responses, Some(ConsensusMethod::LongestCommon))
            .await
            .unwrap();
        assert_eq!(result.content, responses[0].content);
        assert_eq!(result.agreement, LONGEST_COMMON_FLOOR);
        assert!(result.requires_review);
    }

    #[tokio::test]
    async fn confidence_weighted_reports_weights() {
        let responses = vec![
            resp("a", "Use a bounded channel between the stages", 0.001),
            resp("b", "Use a bounded channel between the stages", 0.003),
        ];
        let result = engine()
            .build(&responses, Some(ConsensusMethod::ConfidenceWeighted))
            .await
            .unwrap();
        assert_eq!(result.method, ConsensusMethod::ConfidenceWeighted);
        let weights = &result.metadata["weights"];
        assert!(weights["a"].as_f64().unwrap() > weights["b"].as_f64().unwrap());
        assert!((result.agreement - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn forced_review_threshold() {
        let mut cfg = ConsensusConfig::default();
        cfg.majority_vote.require_review = true;
        let engine = ConsensusEngine::new(cfg);
        let responses = vec![resp("a", "yes", 0.0), resp("b", "yes", 0.0)];
        let result = engine
            .build(&responses, Some(ConsensusMethod::MajorityVote))
            .await
            .unwrap();
        assert_eq!(result.agreement, 1.0);
        assert!(result.requires_review);
        assert_eq!(result.warnings, vec![ConsensusWarning::ForcedReview]);
    }

    struct BrokenEmbedder;

    #[async_trait::async_trait]
    impl Embedder for BrokenEmbedder {
        fn name(&self) -> &str {
            "broken"
        }

        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, crate::llm::LlmError> {
            Err(crate::llm::LlmError::Timeout)
        }
    }

    #[tokio::test]
    async fn embedding_failure_falls_back_to_lexical() {
        let engine = engine().with_embedder(Arc::new(BrokenEmbedder));
        let responses = vec![
            resp("a", "identical long answer about queues", 0.0),
            resp("b", "identical long answer about queues", 0.0),
        ];
        let result = engine
            .build(&responses, Some(ConsensusMethod::SemanticSimilarity))
            .await
            .unwrap();
        assert!(matches!(
            result.warnings.first(),
            Some(ConsensusWarning::EmbeddingFallback { .. })
        ));
        assert!((result.agreement - 1.0).abs() < 1e-6);
        assert!(!result.requires_review);
    }

    struct NanEmbedder;

    #[async_trait::async_trait]
    impl Embedder for NanEmbedder {
        fn name(&self) -> &str {
            "nan"
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, crate::llm::LlmError> {
            Ok(texts.iter().map(|_| vec![f32::NAN, 1.0]).collect())
        }
    }

    #[tokio::test]
    async fn nan_embeddings_force_review() {
        let engine = engine().with_embedder(Arc::new(NanEmbedder));
        let responses = vec![
            resp("a", "identical long answer about queues", 0.0),
            resp("b", "identical long answer about queues", 0.0),
        ];
        let result = engine
            .build(&responses, Some(ConsensusMethod::SemanticSimilarity))
            .await
            .unwrap();
        assert!(result.agreement.is_finite());
        assert_eq!(result.agreement, 0.0);
        assert!(result.requires_review);
        assert!(result
            .warnings
            .iter()
            .any(|w| matches!(w, ConsensusWarning::LowAgreement { .. })));
    }

    #[test]
    fn non_finite_agreement_is_flagged() {
        let draft = Draft::new("x".into(), f64::NAN, f64::NAN);
        let result = validate(
            ConsensusMethod::SemanticSimilarity,
            draft,
            vec!["a".into(), "b".into()],
            &ConsensusConfig::default(),
        );
        assert!(result.requires_review);
        assert!(result
            .warnings
            .iter()
            .any(|w| matches!(w, ConsensusWarning::LowConfidence { .. })));
    }
}
