use crate::types::JobResult;

/// Delays for the first five retries, in seconds.
pub const BACKOFF_TABLE_SECS: [u64; 5] = [60, 120, 240, 480, 960];

/// No computed retry waits longer than an hour.
pub const MAX_BACKOFF_SECS: u64 = 3_600;

const BASE_DELAY_SECS: u64 = 60;

/// Delay before the retry that follows `retry_count` previous retries.
///
/// Table lookup for the first five, then `min(2^retry_count * 60, 3600)`.
pub fn backoff_delay_secs(retry_count: u32) -> u64 {
    if let Some(&delay) = BACKOFF_TABLE_SECS.get(retry_count as usize) {
        return delay;
    }
    1u64.checked_shl(retry_count)
        .and_then(|factor| factor.checked_mul(BASE_DELAY_SECS))
        .map_or(MAX_BACKOFF_SECS, |delay| delay.min(MAX_BACKOFF_SECS))
}

/// Delay for retrying after `result`; an explicit delay on the result always wins.
pub fn retry_delay_secs(result: &JobResult, retry_count: u32) -> u64 {
    result
        .retry_delay_secs
        .unwrap_or_else(|| backoff_delay_secs(retry_count))
}
