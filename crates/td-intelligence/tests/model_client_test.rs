//! Fan-out behavior of the model client against scripted providers.

use std::sync::Arc;
use std::time::Duration;

use td_intelligence::backends::{builtin_backends, BackendCatalog, CLAUDE_SONNET, GEMINI_PRO, GPT_4O};
use td_intelligence::llm::{LlmError, LlmRequest, MockProvider};
use td_intelligence::retry::RetryPolicy;
use td_intelligence::ModelClient;

fn catalog() -> Arc<BackendCatalog> {
    Arc::new(BackendCatalog::new(builtin_backends()))
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ===========================================================================
// call_many
// ===========================================================================

#[tokio::test]
async fn one_failure_out_of_three_is_not_an_error() {
    let client = ModelClient::new(catalog())
        .with_retry_policy(RetryPolicy::immediate(1))
        .with_provider(CLAUDE_SONNET, Arc::new(MockProvider::new().with_text("a")))
        .with_provider(
            GPT_4O,
            Arc::new(MockProvider::new().with_error(LlmError::ApiError {
                status: 401,
                message: "bad key".into(),
            })),
        )
        .with_provider(GEMINI_PRO, Arc::new(MockProvider::new().with_text("c")));

    let outcome = client
        .call_many(&ids(&[CLAUDE_SONNET, GPT_4O, GEMINI_PRO]), &LlmRequest::new("hi"))
        .await
        .expect("partial success");

    assert_eq!(outcome.responses.len(), 2);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].backend, GPT_4O);
    assert_eq!(outcome.responses[0].backend, CLAUDE_SONNET);
    assert_eq!(outcome.responses[1].backend, GEMINI_PRO);
}

#[tokio::test]
async fn response_order_follows_request_order_not_completion_order() {
    let client = ModelClient::new(catalog())
        .with_provider(
            CLAUDE_SONNET,
            Arc::new(MockProvider::new().with_delay(Duration::from_millis(50))),
        )
        .with_provider(GPT_4O, Arc::new(MockProvider::new()));

    let outcome = client
        .call_many(&ids(&[CLAUDE_SONNET, GPT_4O]), &LlmRequest::new("hi"))
        .await
        .unwrap();
    let order: Vec<_> = outcome.responses.iter().map(|r| r.backend.as_str()).collect();
    assert_eq!(order, vec![CLAUDE_SONNET, GPT_4O]);
}

#[tokio::test]
async fn all_failing_backends_are_enumerated() {
    let client = ModelClient::new(catalog()).with_retry_policy(RetryPolicy::immediate(1));
    let err = client
        .call_many(&ids(&[GPT_4O, "no-such-backend"]), &LlmRequest::new("hi"))
        .await
        .unwrap_err();
    assert_eq!(err.failures.len(), 2);
    assert!(err.to_string().contains("no-such-backend"));
}

#[tokio::test]
async fn empty_backend_list_yields_empty_outcome() {
    let client = ModelClient::new(catalog());
    let outcome = client.call_many(&[], &LlmRequest::new("hi")).await.unwrap();
    assert!(outcome.responses.is_empty());
    assert!(outcome.failures.is_empty());
}

#[tokio::test]
async fn transient_errors_are_retried_inside_fan_out() {
    let flaky = MockProvider::new()
        .with_error(LlmError::Timeout)
        .with_error(LlmError::RateLimited { retry_after_secs: None })
        .with_text("third time");
    let client = ModelClient::new(catalog())
        .with_retry_policy(RetryPolicy::immediate(3))
        .with_provider(GPT_4O, Arc::new(flaky));

    let outcome = client
        .call_many(&ids(&[GPT_4O]), &LlmRequest::new("hi"))
        .await
        .unwrap();
    assert_eq!(outcome.responses[0].content, "third time");
    assert_eq!(outcome.responses[0].metadata["attempts"], 3);
}

#[tokio::test]
async fn fan_out_shares_one_trace_id() {
    let client = ModelClient::new(catalog())
        .with_provider(CLAUDE_SONNET, Arc::new(MockProvider::new()))
        .with_provider(GPT_4O, Arc::new(MockProvider::new()));

    let outcome = client
        .call_many_traced(&ids(&[CLAUDE_SONNET, GPT_4O]), &LlmRequest::new("hi"), "abc123")
        .await
        .unwrap();
    for response in &outcome.responses {
        assert_eq!(response.metadata["trace_id"], "abc123");
    }
}

// ===========================================================================
// Estimation
// ===========================================================================

#[test]
fn cost_of_estimated_tokens_is_deterministic() {
    let client = ModelClient::new(catalog());
    let prompt = "Summarize the quarterly report in three bullet points.";
    let output = "Revenue grew. Costs fell. Margin improved.";
    let estimate = || {
        client
            .estimate_cost(
                GPT_4O,
                client.estimate_tokens(prompt, Some(GPT_4O)),
                client.estimate_tokens(output, Some(GPT_4O)),
            )
            .unwrap()
    };
    let first = estimate();
    assert!(first > 0.0);
    assert_eq!(first, estimate());
}

#[test]
fn anthropic_counts_more_tokens_for_the_same_text() {
    let client = ModelClient::new(catalog());
    let text = "x".repeat(700);
    assert_eq!(client.estimate_tokens(&text, Some(GPT_4O)), 175);
    assert_eq!(client.estimate_tokens(&text, Some(CLAUDE_SONNET)), 200);
    assert_eq!(client.estimate_tokens(&text, None), 175);
}
