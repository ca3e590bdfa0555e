//! Capped exponential backoff for idempotent calls (liveness, handshakes,
//! readiness). Never used around `execute`.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stagehand_protocol::ExecutionResult;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    /// Overall ceiling across all attempts.
    pub deadline_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::local()
    }
}

impl BackoffPolicy {
    /// A process on the same host comes up within seconds.
    pub fn local() -> Self {
        Self {
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 2_000,
            max_attempts: 30,
            deadline_secs: 60,
        }
    }

    /// Pods need scheduling and image pulls.
    pub fn cluster() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 1.5,
            max_delay_ms: 10_000,
            max_attempts: 90,
            deadline_secs: 300,
        }
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Run `call` until it succeeds, fails with a non-transient error, runs out of
/// attempts or would sleep past the deadline. The last error is returned.
pub async fn retry_idempotent<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut call: F,
) -> ExecutionResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ExecutionResult<T>>,
{
    let started = Instant::now();
    let deadline = policy.deadline();
    let mut attempt = 0_u32;
    loop {
        attempt += 1;
        let error = match call().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };
        if !error.is_transient() {
            return Err(error);
        }
        let delay = policy.delay_for(attempt);
        if attempt >= policy.max_attempts.max(1) || started.elapsed() + delay > deadline {
            warn!(operation, attempt, error = %error, "giving up after retries");
            return Err(error);
        }
        debug!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use stagehand_protocol::ExecutionError;

    use super::*;

    fn fast(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 4,
            max_attempts,
            deadline_secs: 5,
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = BackoffPolicy::local();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(20), Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry_idempotent(&fast(10), "alive", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(ExecutionError::Disconnected("refused".into()))
                } else {
                    Ok("up")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "up");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let result: ExecutionResult<()> = retry_idempotent(&fast(10), "handshake", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExecutionError::PermissionDenied("nope".into())) }
        })
        .await;
        assert!(matches!(result, Err(ExecutionError::PermissionDenied(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: ExecutionResult<()> = retry_idempotent(&fast(3), "alive", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExecutionError::Timeout { after_secs: 1 }) }
        })
        .await;
        assert!(matches!(result, Err(ExecutionError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
