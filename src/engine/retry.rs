//! Backoff computation for durable node retries.

use std::time::Duration;

use rand::Rng;

use crate::types::RetryPolicy;

/// Delay before re-dispatching after failed attempt `attempt` (1-based):
/// `min(max_delay, base_delay * 2^(attempt-1))`, multiplied by a uniform
/// factor in `[0.5, 1.0)` when jitter is enabled.
#[must_use]
pub fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let scaled = policy
        .base_delay
        .checked_mul(1u32 << exp)
        .unwrap_or(policy.max_delay);
    let capped = scaled.min(policy.max_delay);
    if policy.jitter {
        capped.mul_f64(rand::thread_rng().gen_range(0.5..1.0))
    } else {
        capped
    }
}
