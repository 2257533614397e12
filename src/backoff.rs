//! Retry delay policies.
//!
//! A backoff maps the attempt count (1 on the first failure) to the delay
//! before the next run. `None` tells the queue to discard the job instead of
//! rescheduling it.

use std::{sync::Arc, time::Duration};

/// Maps attempt count to the next-run delay; `None` discards the job.
pub type Backoff = Arc<dyn Fn(i32) -> Option<Duration> + Send + Sync>;

/// Base delay of [`default_exponential`].
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Delay ceiling of [`default_exponential`].
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60 * 60);

/// Exponential backoff: `base * 2^(attempts-1)`, capped at `cap`, with up to
/// 10% jitter. The returned delay never exceeds `cap`.
pub fn exponential(base: Duration, cap: Duration) -> Backoff {
    Arc::new(move |attempts| {
        let exp = attempts.max(1) as u32 - 1;
        let delay = base.saturating_mul(2u32.saturating_pow(exp)).min(cap);
        let jitter = delay.mul_f64(rand::random::<f64>() * 0.1);
        Some(delay.saturating_add(jitter).min(cap))
    })
}

/// The backoff used by a `Client` when none is configured.
pub fn default_exponential() -> Backoff {
    exponential(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_within_jitter_bounds() {
        let backoff = exponential(Duration::from_secs(1), Duration::from_secs(3600));

        for attempts in 1..=5_i32 {
            let floor = Duration::from_secs(1_u64 << (attempts - 1));
            let ceiling = floor.mul_f64(1.1);
            let delay = backoff(attempts).unwrap();
            assert!(
                delay >= floor && delay <= ceiling,
                "attempt {attempts}: {delay:?} outside [{floor:?}, {ceiling:?}]"
            );
        }
    }

    #[test]
    fn never_exceeds_cap() {
        let cap = Duration::from_secs(30);
        let backoff = exponential(Duration::from_secs(1), cap);

        for attempts in [6, 10, 100, i32::MAX] {
            assert!(backoff(attempts).unwrap() <= cap);
        }
    }

    #[test]
    fn nonpositive_attempts_behave_like_the_first() {
        let backoff = exponential(Duration::from_secs(2), Duration::from_secs(3600));

        for attempts in [i32::MIN, -1, 0, 1] {
            let delay = backoff(attempts).unwrap();
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(2).mul_f64(1.1));
        }
    }
}
