//! Timeouts and bounded exponential backoff for external calls.

use std::future::Future;
use std::time::Duration;

use crate::config::PipelineConfig;

/// Errors that can come out of a retried call.
pub trait Retryable: std::fmt::Display {
    /// Build the error reported when an attempt exceeds its timeout.
    fn timed_out(operation: &str, after: Duration) -> Self;

    /// Whether another attempt could succeed.
    fn is_retryable(&self) -> bool {
        true
    }
}

/// How external calls are attempted.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Per-attempt timeout; `None` waits indefinitely
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.retry.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.retry.max_backoff_ms),
            multiplier: 2.0,
            call_timeout: (config.call_timeout_seconds > 0).then(|| config.call_timeout()),
        }
    }

    /// One attempt, no timeout.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            call_timeout: None,
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let delay_ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let delay_ms = delay_ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Returns the error of the last attempt.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let outcome = match self.call_timeout {
                Some(limit) => match tokio::time::timeout(limit, call()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(E::timed_out(operation, limit)),
                },
                None => call().await,
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        crate::debug_event!(
                            "retry",
                            "recovered",
                            "{operation} succeeded on attempt {attempt}"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= max_attempts || !e.is_retryable() => return Err(e),
                Err(e) => {
                    let delay = self.backoff_for(attempt);
                    tracing::warn!(
                        "[retry] {operation} attempt {attempt}/{max_attempts} failed: {e}; retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
