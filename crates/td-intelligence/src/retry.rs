use std::future::Future;
use std::time::Duration;

use td_core::config::RetryConfig;
use td_telemetry::metrics::{global_metrics, BACKEND_RETRIES_TOTAL};
use tracing::{debug, warn};

use crate::llm::LlmError;

/// Exponential backoff policy for one backend call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never zero.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// `base × 2^attempt`, capped at `max_delay`. `attempt` is zero-based.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the next attempt; a retry-after hint wins but is capped
    /// the same way.
    pub fn delay_for(&self, attempt: u32, err: &LlmError) -> Duration {
        match err.retry_after() {
            Some(hint) => hint.min(self.max_delay),
            None => self.backoff_for(attempt),
        }
    }
}

/// Run `f` until it succeeds, fails terminally, or attempts run out.
///
/// `label` names the backend in logs and the retry counter.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, label: &str, mut f: F) -> Result<T, LlmError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0;
    loop {
        match f(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(backend = label, attempt = attempt + 1, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !err.is_retryable() || attempt + 1 >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt, &err);
                warn!(
                    backend = label,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "backend call failed, retrying"
                );
                global_metrics().increment_counter(BACKEND_RETRIES_TOTAL, &[("backend", label)]);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(5000));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(5000));
    }

    #[test]
    fn retry_after_hint_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        };
        let short = LlmError::RateLimited {
            retry_after_secs: Some(2),
        };
        let long = LlmError::RateLimited {
            retry_after_secs: Some(600),
        };
        assert_eq!(policy.delay_for(0, &short), Duration::from_secs(2));
        assert_eq!(policy.delay_for(0, &long), Duration::from_secs(10));
        assert_eq!(policy.delay_for(1, &LlmError::Timeout), Duration::from_millis(200));
    }

    #[test]
    fn from_config_never_yields_zero_attempts() {
        let cfg = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&cfg).max_attempts, 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::immediate(3), "test-backend", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LlmError::ApiError {
                        status: 502,
                        message: "bad gateway".into(),
                    })
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::immediate(5), "test-backend", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LlmError::ApiError {
                    status: 401,
                    message: "unauthorized".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(LlmError::ApiError { status: 401, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::immediate(2), "test-backend", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Timeout) }
        })
        .await;
        assert_eq!(result, Err(LlmError::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
