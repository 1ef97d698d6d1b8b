// Retry backoff shared by saga steps, conversion jobs and worker queues:
// exponential from the initial delay, doubling per attempt, capped, with
// +/-10% jitter so a burst of failures does not come back as a burst of
// retries.

use rand::Rng;
use stack_common::time::{self, Timestamp};

use crate::config::{RETRY_INITIAL_DELAY_SECS, RETRY_JITTER_RATIO, RETRY_MAX_DELAY_SECS};

/// Delay before the given attempt (1-based), jitter applied.
pub fn retry_delay_secs(attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = RETRY_INITIAL_DELAY_SECS
        .saturating_mul(1u64 << exponent)
        .min(RETRY_MAX_DELAY_SECS);
    let jitter_span = (base as f64 * RETRY_JITTER_RATIO) as i64;
    if jitter_span == 0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    (base as i64 + jitter).max(1) as u64
}

/// Absolute due time for the given attempt.
pub fn next_retry_at(attempt: u32) -> Timestamp {
    time::after_secs(retry_delay_secs(attempt))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(attempt: u32) -> (u64, u64) {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = RETRY_INITIAL_DELAY_SECS
            .saturating_mul(1u64 << exponent)
            .min(RETRY_MAX_DELAY_SECS);
        let span = (base as f64 * RETRY_JITTER_RATIO) as u64;
        (base - span, base + span)
    }

    #[test]
    fn delays_double_and_cap() {
        for attempt in 1..=10 {
            let (lo, hi) = bounds(attempt);
            for _ in 0..32 {
                let delay = retry_delay_secs(attempt);
                assert!(delay >= lo && delay <= hi, "attempt {attempt}: {delay}");
            }
        }
        // first attempt centers on one minute, late attempts on the cap
        assert!(bounds(1).0 <= 60 && 60 <= bounds(1).1);
        let (lo, hi) = bounds(10);
        assert!(lo <= RETRY_MAX_DELAY_SECS && RETRY_MAX_DELAY_SECS <= hi);
    }

    #[test]
    fn due_time_is_in_the_future() {
        let due = next_retry_at(1);
        assert!(due > stack_common::time::now());
    }
}
