//! Retry classification and jittered exponential backoff for model calls.

use std::time::Duration;

use rand::Rng;

/// HTTP statuses treated as transient provider failures.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 529];

/// Error shape the retry policy cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The provider answered with an HTTP status.
    Status(u16),
    /// Timeout, connection reset, DNS, or another network-level failure.
    Transport,
    /// Anything else: decode failures, invalid responses, missing credentials.
    Other,
}

pub fn is_retryable(class: ErrorClass) -> bool {
    match class {
        ErrorClass::Status(status) => RETRYABLE_STATUSES.contains(&status),
        ErrorClass::Transport => true,
        ErrorClass::Other => false,
    }
}

/// Delay before retry `attempt` (1-indexed) with jitter drawn from `rng`.
///
/// `min(base * 2^(attempt-1) + U[0, base], max)`.
pub fn compute_backoff_delay_with<R: Rng + ?Sized>(
    attempt: u32,
    base: Duration,
    max: Duration,
    rng: &mut R,
) -> Duration {
    let base_secs = base.as_secs_f64().max(0.0);
    let exponent = attempt.saturating_sub(1).min(30);
    let jitter = if base_secs > 0.0 {
        rng.gen_range(0.0..=base_secs)
    } else {
        0.0
    };
    let delay = base_secs * f64::from(1u32 << exponent) + jitter;
    Duration::from_secs_f64(delay.min(max.as_secs_f64()))
}

pub fn compute_backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    compute_backoff_delay_with(attempt, base, max, &mut rand::thread_rng())
}
