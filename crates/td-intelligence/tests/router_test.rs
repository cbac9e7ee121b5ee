//! Routing through the public API: classification, rule overrides,
//! preferences and hot reload.

use std::collections::HashSet;
use std::sync::Arc;

use td_core::config::{RouteRuleConfig, RoutingConfig};
use td_core::TaskCategory;
use td_intelligence::backends::{builtin_backends, BackendCatalog, CLAUDE_SONNET, GEMINI_PRO, GPT_4O};
use td_intelligence::model_router::{classify_with, KeywordTable, RoutingSettings};
use td_intelligence::{Router, RoutingPreferences};

fn router() -> Router {
    Router::new(
        Arc::new(BackendCatalog::new(builtin_backends())),
        RoutingSettings::default(),
    )
}

#[test]
fn debug_prompt_is_technical() {
    let c = classify_with(&KeywordTable::default(), "Please debug this crash for me");
    assert_eq!(c.category, TaskCategory::Technical);
    assert!(c.matched_terms.iter().any(|t| t == "debug"));
    assert!(c.confidence > 0.0);
}

#[test]
fn keywordless_prompt_is_mixed_with_zero_confidence() {
    let c = classify_with(
        &KeywordTable::default(),
        "Tell me everything you know about the history of lighthouses along the northern coast",
    );
    assert_eq!(c.category, TaskCategory::Mixed);
    assert!(c.matched_terms.is_empty());
    assert_eq!(c.confidence, 0.0);
}

#[tokio::test]
async fn fallbacks_never_repeat_or_include_primary() {
    let router = router();
    let prompts = [
        "debug the sql query",
        "write a poem about autumn",
        "summarize the key points",
        "classify the sentiment of this review",
        "extract all email addresses",
        "analyze the trend in the metric",
        "draft a long-term strategy for market growth",
        "hello there",
    ];
    let prefs = [
        RoutingPreferences::default(),
        RoutingPreferences {
            prefer_cheap: true,
            ..Default::default()
        },
        RoutingPreferences {
            prefer_fast: true,
            ..Default::default()
        },
        RoutingPreferences {
            prefer_cheap: true,
            prefer_fast: true,
            max_cost: Some(0.000_01),
            ..Default::default()
        },
    ];
    for prompt in prompts {
        for pref in &prefs {
            let decision = router.route(prompt, None, pref).await.unwrap();
            assert!(!decision.fallbacks.contains(&decision.primary), "{prompt}");
            let unique: HashSet<_> = decision.fallbacks.iter().collect();
            assert_eq!(unique.len(), decision.fallbacks.len(), "{prompt}");
            assert_eq!(decision.ordered().len(), 3);
            assert!(!decision.rationale.is_empty());
        }
    }
}

#[tokio::test]
async fn configured_rule_overrides_default() {
    let mut cfg = RoutingConfig::default();
    cfg.rules.insert(
        "creative".to_string(),
        RouteRuleConfig {
            primary: GEMINI_PRO.to_string(),
            fallbacks: vec![CLAUDE_SONNET.to_string(), GPT_4O.to_string()],
        },
    );
    let router = Router::new(
        Arc::new(BackendCatalog::new(builtin_backends())),
        RoutingSettings::from_config(&cfg).unwrap(),
    );
    let decision = router
        .route("write a short story about a lighthouse keeper", None, &RoutingPreferences::default())
        .await
        .unwrap();
    assert_eq!(decision.task_type, TaskCategory::Creative);
    assert_eq!(decision.primary, GEMINI_PRO);
    assert_eq!(decision.fallbacks, vec![CLAUDE_SONNET.to_string(), GPT_4O.to_string()]);
}

#[tokio::test]
async fn reload_changes_subsequent_decisions() {
    let router = router();
    let before = router
        .route("debug the failing function", None, &RoutingPreferences::default())
        .await
        .unwrap();
    assert_eq!(before.primary, CLAUDE_SONNET);

    let mut settings = RoutingSettings::default();
    settings.table.insert(
        TaskCategory::Technical,
        RouteRuleConfig {
            primary: GPT_4O.to_string(),
            fallbacks: vec![CLAUDE_SONNET.to_string(), GEMINI_PRO.to_string()],
        },
    );
    router.reload(settings).await;

    let after = router
        .route("debug the failing function", None, &RoutingPreferences::default())
        .await
        .unwrap();
    assert_eq!(after.primary, GPT_4O);
}

#[tokio::test]
async fn estimates_are_reported_for_the_primary() {
    let router = router();
    let decision = router
        .route("summarize this article", None, &RoutingPreferences::default())
        .await
        .unwrap();
    assert_eq!(decision.primary, GEMINI_PRO);
    assert!(decision.estimated_cost > 0.0);
    assert!(decision.estimated_latency_ms > 0);
}
