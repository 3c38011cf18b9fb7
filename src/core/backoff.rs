use std::time::Duration;

use rand::Rng;

use crate::core::config::WorkerSettings;

const JITTER_FRAC: f64 = 0.2;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) base_secs: u64,
    pub(crate) cap_secs: u64,
}

impl RetryPolicy {
    pub(crate) fn from_settings(worker: &WorkerSettings) -> Self {
        Self { base_secs: worker.backoff_base_secs, cap_secs: worker.backoff_cap_secs }
    }
}

/// Exponential delay for the given attempt number (1-based), before jitter.
/// Attempt 1 waits `base`, attempt 2 waits `base * 2`, and so on, capped.
pub(crate) fn base_delay(attempt: u32, policy: RetryPolicy) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let secs = policy.base_secs.saturating_mul(1u64 << exponent).min(policy.cap_secs);
    Duration::from_secs(secs)
}

/// Full backoff delay: exponential base with ±20% uniform jitter applied
/// after the cap, so the jittered value still stays near the cap.
pub(crate) fn backoff_delay(attempt: u32, policy: RetryPolicy) -> Duration {
    let base = base_delay(attempt, policy).as_secs_f64();
    let jitter = rand::thread_rng().gen_range(-JITTER_FRAC..=JITTER_FRAC);
    Duration::from_secs_f64((base * (1.0 + jitter)).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: RetryPolicy = RetryPolicy { base_secs: 2, cap_secs: 300 };

    #[test]
    fn base_delay_doubles_per_attempt() {
        assert_eq!(base_delay(1, POLICY), Duration::from_secs(2));
        assert_eq!(base_delay(2, POLICY), Duration::from_secs(4));
        assert_eq!(base_delay(3, POLICY), Duration::from_secs(8));
        assert_eq!(base_delay(5, POLICY), Duration::from_secs(32));
    }

    #[test]
    fn base_delay_is_non_decreasing_and_capped() {
        let mut previous = Duration::ZERO;
        for attempt in 1..=40 {
            let delay = base_delay(attempt, POLICY);
            assert!(delay >= previous, "attempt {attempt} regressed");
            assert!(delay <= Duration::from_secs(POLICY.cap_secs));
            previous = delay;
        }
        assert_eq!(base_delay(40, POLICY), Duration::from_secs(POLICY.cap_secs));
    }

    #[test]
    fn zero_attempt_behaves_like_first() {
        assert_eq!(base_delay(0, POLICY), base_delay(1, POLICY));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for attempt in 1..=10 {
            let base = base_delay(attempt, POLICY).as_secs_f64();
            for _ in 0..50 {
                let jittered = backoff_delay(attempt, POLICY).as_secs_f64();
                assert!(jittered >= base * (1.0 - JITTER_FRAC) - 1e-9);
                assert!(jittered <= base * (1.0 + JITTER_FRAC) + 1e-9);
            }
        }
    }
}
