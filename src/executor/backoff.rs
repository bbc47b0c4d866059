use rand::Rng;
use std::time::Duration;

/// Delay before retry number `attempt` (1-based).
///
/// The window doubles per attempt starting at `min`, is capped at `max`
/// (also when the shift overflows), and the actual delay is drawn uniformly
/// from `[0, window)`.
pub fn retry_backoff<R: Rng>(attempt: u32, min: Duration, max: Duration, rng: &mut R) -> Duration {
    let min_nanos = u64::try_from(min.as_nanos()).unwrap_or(u64::MAX);
    let max_nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);

    let window = 1u64
        .checked_shl(attempt)
        .and_then(|factor| min_nanos.checked_mul(factor))
        .filter(|window| *window <= max_nanos && *window >= min_nanos)
        .unwrap_or(max_nanos);

    if window == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rng.random_range(0..window))
}
