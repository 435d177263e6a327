//! Retry with exponential backoff
//!
//! Wraps every opaque node execution. Control-flow nodes are never
//! retried; their semantics are deterministic. A `Cancelled` outcome is
//! never retried either.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::error::{EngineError, Result};
use crate::node::NodeResult;

/// Per-node retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (1 = no retry)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Multiplier applied per subsequent attempt
    pub backoff_multiplier: f64,
    /// Ceiling on the computed delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Overlay config keys (`max_attempts`, `initial_delay_ms`,
    /// `backoff_multiplier`, `max_delay_ms`) onto a base policy
    pub fn from_config(
        base: &RetryPolicy,
        config: &HashMap<String, serde_json::Value>,
    ) -> RetryPolicy {
        let mut policy = base.clone();
        if let Some(n) = config.get("max_attempts").and_then(|v| v.as_u64()) {
            policy.max_attempts = (n as u32).max(1);
        }
        if let Some(ms) = config.get("initial_delay_ms").and_then(|v| v.as_u64()) {
            policy.initial_delay = Duration::from_millis(ms);
        }
        if let Some(m) = config.get("backoff_multiplier").and_then(|v| v.as_f64()) {
            policy.backoff_multiplier = m.max(1.0);
        }
        if let Some(ms) = config.get("max_delay_ms").and_then(|v| v.as_u64()) {
            policy.max_delay = Duration::from_millis(ms);
        }
        policy
    }

    /// Backoff before the attempt after `attempt` (1-based), without jitter:
    /// `min(initial * multiplier^(attempt-1), max)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Backoff with ±20% jitter applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_millis((base * jitter) as u64)
    }
}

/// Outcome classification for one attempt
fn attempt_error(result: std::result::Result<NodeResult, EngineError>) -> Result<NodeResult> {
    match result {
        Ok(NodeResult::Fail {
            kind,
            message,
            retryable,
        }) => Err(EngineError::Node {
            kind,
            message,
            retryable,
        }),
        other => other,
    }
}

/// Run an operation under a retry policy and optional circuit breaker.
///
/// `attempt_fn(attempt)` produces one invocation. The breaker is consulted
/// before and fed after every attempt. `on_retry(next_attempt, delay_ms)`
/// fires before each backoff sleep; `on_failure(attempt, error)` fires for
/// every failed attempt, terminal or not.
pub async fn run_with_retry<F, Fut>(
    policy: &RetryPolicy,
    breaker: Option<&CircuitBreaker>,
    cancel: &CancellationToken,
    mut attempt_fn: F,
    mut on_failure: impl FnMut(u32, &EngineError),
    mut on_retry: impl FnMut(u32, u64),
) -> Result<NodeResult>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<NodeResult>>,
{
    let mut attempt: u32 = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let admitted = match breaker {
            Some(b) => b.check().await,
            None => Ok(()),
        };

        let outcome = match admitted {
            Err(open) => Err(open),
            Ok(()) => {
                let result = attempt_error(attempt_fn(attempt).await);
                if let Some(b) = breaker {
                    match &result {
                        Err(EngineError::Cancelled) => {}
                        Err(_) => b.record(false).await,
                        Ok(_) => b.record(true).await,
                    }
                }
                result
            }
        };

        let error = match outcome {
            Ok(result) => return Ok(result),
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(error) => error,
        };

        on_failure(attempt, &error);

        if !error.is_retryable() || attempt >= policy.max_attempts {
            return Err(error);
        }

        let delay = policy.delay_for(attempt);
        on_retry(attempt + 1, delay.as_millis() as u64);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        }
        attempt += 1;
    }
}
