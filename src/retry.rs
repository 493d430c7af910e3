// =============================================================================
// Retry Engine — bounded, jittered, policy-driven retries
// =============================================================================
//
// `execute` runs a fallible async operation at most `max_attempts` times.
// Between attempts it sleeps `min(max_delay, base_delay * factor(attempt))`
// scaled by random jitter. Whether an error is worth retrying is decided by
// the policy's predicate over the error kind, never by matching messages.
//
// Cancellation: dropping the future returned by `execute` (e.g. when the
// orchestrator shuts down) cancels the in-flight attempt and any pending
// backoff sleep.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{ScrapeError, ScrapeResult};
use crate::metrics::MetricsRegistry;

/// Delay growth curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

/// Retry behavior for one class of operations.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// Jitter fraction in [0, 1]; the delay is scaled by (1 ± rand * jitter).
    pub jitter: f64,
    /// Deadline applied around each individual attempt.
    pub per_attempt_timeout: Option<Duration>,
    /// Which errors are worth another attempt.
    pub retryable: fn(&ScrapeError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy {
    /// The engine's default: 3 attempts, exponential backoff from 1 s.
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Exponential,
            jitter: 0.1,
            per_attempt_timeout: Some(Duration::from_secs(30)),
            retryable: ScrapeError::is_transient,
        }
    }

    /// Many fast attempts for cheap idempotent operations.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff: Backoff::Exponential,
            jitter: 0.2,
            per_attempt_timeout: Some(Duration::from_secs(15)),
            retryable: ScrapeError::is_transient,
        }
    }

    /// Few slow attempts for heavyweight operations.
    pub fn patient() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff: Backoff::Linear,
            jitter: 0.05,
            per_attempt_timeout: Some(Duration::from_secs(120)),
            retryable: ScrapeError::is_transient,
        }
    }

    /// Delay before attempt number `attempt` (1-based; the delay precedes
    /// attempt 2 and later).
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = match self.backoff {
            Backoff::Fixed => 1.0,
            Backoff::Linear => attempt as f64,
            Backoff::Exponential => 2f64.powi(attempt.saturating_sub(1) as i32),
        };
        let base = self.base_delay.as_secs_f64() * factor;
        let capped = base.min(self.max_delay.as_secs_f64());

        let jitter = if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-1.0..=1.0) * self.jitter;
            1.0 + spread
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * jitter).max(0.0))
    }
}

/// Retry executor shared by the pipeline.
pub struct RetryEngine {
    metrics: Arc<MetricsRegistry>,
}

impl RetryEngine {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self { metrics }
    }

    /// Run `op` under `policy`. `op` is called at most `max_attempts` times;
    /// the final error surfaces unchanged.
    pub async fn execute<F, Fut, T>(
        &self,
        operation_name: &str,
        policy: &RetryPolicy,
        mut op: F,
    ) -> ScrapeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ScrapeResult<T>>,
    {
        self.metrics.increment_counter("retry.total_operations", 1);

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let result = match policy.per_attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(ScrapeError::Timeout(limit)),
                },
                None => op().await,
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        self.metrics.increment_counter("retry.success_after_retry", 1);
                        debug!(operation = operation_name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let out_of_budget = attempt >= policy.max_attempts;
                    if out_of_budget || !(policy.retryable)(&error) {
                        self.metrics.increment_counter("retry.failed_operations", 1);
                        warn!(
                            operation = operation_name,
                            attempt,
                            error = %error,
                            retryable = (policy.retryable)(&error),
                            "operation failed; giving up"
                        );
                        return Err(error);
                    }

                    let delay = policy.delay_for(attempt);
                    self.metrics.increment_counter("retry.retry_count", 1);
                    debug!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "attempt failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
