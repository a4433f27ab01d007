//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `attempt` (1 = first retry).
///
/// `base_ms * 2^(attempt-1)` plus up to `jitter_ratio` of that, never above `max_ms`.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64, jitter_ratio: f64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    let jitter_range = (capped_delay as f64 * jitter_ratio.clamp(0.0, 1.0)) as u64;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay.saturating_add(jitter).min(max_ms))
}
