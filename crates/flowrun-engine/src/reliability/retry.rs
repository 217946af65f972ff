//! Retry execution for service-task attempts
//!
//! The retry policy lives in the definition document (`retryPolicy` on a
//! service task); this module turns it into an attempt loop with backoff
//! and jitter. Nodes without a policy run exactly once.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::EngineError;
use flowrun_graph::{BackoffStrategy, RetryPolicy};

/// Jitter factor applied to every non-zero delay
const JITTER: f64 = 0.1;

/// Delay before the given 1-based attempt.
///
/// Attempt 1 never waits. Fixed backoff repeats `delay_ms`; linear scales
/// it with the retry number; exponential doubles it per retry.
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    if attempt <= 1 || policy.delay_ms == 0 {
        return Duration::ZERO;
    }

    let retry_number = (attempt - 1) as u64;
    let base_ms = match policy.backoff_strategy {
        BackoffStrategy::Fixed => policy.delay_ms,
        BackoffStrategy::Linear => policy.delay_ms.saturating_mul(retry_number),
        BackoffStrategy::Exponential => policy
            .delay_ms
            .saturating_mul(1u64 << (retry_number - 1).min(32)),
    };

    let jitter_ms = (base_ms as f64 * JITTER) as u64;
    let jittered = if jitter_ms > 0 {
        let offset = rand::thread_rng().gen_range(0..=jitter_ms * 2);
        base_ms + offset - jitter_ms
    } else {
        base_ms
    };

    Duration::from_millis(jittered)
}

/// Run `op` up to `policy.max_attempts` times.
///
/// `on_retry` fires before each re-attempt (for the retry counter). The
/// last error is returned when every attempt fails.
pub async fn run_with_retry<T, F, Fut>(
    policy: Option<&RetryPolicy>,
    on_retry: impl Fn(u32),
    op: F,
) -> Result<T, EngineError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let single_shot = RetryPolicy::default();
    let policy = policy.unwrap_or(&single_shot);
    let max_attempts = policy.max_attempts.max(1);

    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(err) if attempt < max_attempts => {
                warn!(attempt, max_attempts, %err, "attempt failed, will retry");
                attempt += 1;
                on_retry(attempt);
                let delay = delay_for_attempt(policy, attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
}
