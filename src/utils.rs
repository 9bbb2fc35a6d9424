//! Small helpers shared by the worker and the backends.

use std::time::Duration;

/// Upper bound for [`calculate_backoff`], in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Exponential backoff in milliseconds for the `attempt`-th consecutive
/// failure, starting at 100ms and capped at [`MAX_BACKOFF_MS`].
///
/// `salt` spreads workers that start failing at the same moment; it adds at
/// most 10% on top of the computed delay.
pub fn calculate_backoff(attempt: u32, salt: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = 100u64.saturating_mul(1u64 << exponent).min(MAX_BACKOFF_MS);
    let spread = (salt.wrapping_mul(7919) % 10) * base / 100;
    (base + spread).min(MAX_BACKOFF_MS)
}

/// Seconds in a duration, rounded up, as the `u32` most wire protocols want.
pub fn duration_secs_u32(duration: Duration) -> u32 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    u32::try_from(secs).unwrap_or(u32::MAX)
}
