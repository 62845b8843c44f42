//! Retry helpers for upstream HTTP calls.

use std::time::Duration;

use rand::Rng;

/// Statuses worth another attempt.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Exponential backoff (1s, 2s, 4s, ...) with up to 25% jitter, capped at 30s.
pub fn retry_backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1_000u64.saturating_mul(1u64 << attempt.min(5));
    let base_ms = base_ms.min(30_000);
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 4);
    Duration::from_millis(base_ms + jitter)
}
