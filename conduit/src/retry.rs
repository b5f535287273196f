use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How a handler classified a failed attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network timeout, 5xx, rate limiting: worth another attempt.
    Transient,
    /// Validation failure, malformed payload, non-rate-limit 4xx.
    Permanent,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Permanent => "permanent",
        }
    }
}

/// Why an item will not be retried.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadReason {
    Exhausted,
    Permanent,
}

/// Disposition of a failed attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RetryDecision {
    RetryAt(DateTime<Utc>),
    Dead(DeadReason),
}

/// Exponential backoff with jitter.
///
/// Delay before the next attempt is `base_delay_ms * 2^attempt_count`,
/// capped at `max_delay_ms`, then scaled by `1 ± jitter_ratio`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds.
    pub max_delay_ms: u64,
    /// Fraction of the delay that may be added or removed at random (0.0 - 1.0).
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 30_000,
            max_delay_ms: 1_800_000, // 30 minutes
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after `attempt_count` attempts.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        // 2^63 already overflows any sane cap
        let exp = attempt_count.min(62) as i32;
        let scaled = (self.base_delay_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.max_delay_ms as f64).max(0.0);
        Duration::milliseconds(capped as i64)
    }

    /// Decide what happens after a failed attempt.
    ///
    /// `jitter` is a sample in `[-1.0, 1.0]`; values outside are clamped.
    pub fn decide(
        &self,
        attempt_count: u32,
        max_attempts: u32,
        failure: FailureClass,
        now: DateTime<Utc>,
        jitter: f64,
    ) -> RetryDecision {
        if failure == FailureClass::Permanent {
            return RetryDecision::Dead(DeadReason::Permanent);
        }
        if attempt_count >= max_attempts {
            return RetryDecision::Dead(DeadReason::Exhausted);
        }

        let base = self.backoff(attempt_count).num_milliseconds() as f64;
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let factor = 1.0 + ratio * jitter.clamp(-1.0, 1.0);
        let delay_ms = (base * factor).clamp(0.0, self.max_delay_ms as f64);

        RetryDecision::RetryAt(now + Duration::milliseconds(delay_ms as i64))
    }

    /// [`RetryPolicy::decide`] with jitter drawn from `rng`.
    pub fn decide_with_rng<R: Rng + ?Sized>(
        &self,
        attempt_count: u32,
        max_attempts: u32,
        failure: FailureClass,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> RetryDecision {
        let jitter = rng.gen_range(-1.0..=1.0);
        self.decide(attempt_count, max_attempts, failure, now, jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter_ratio: 0.25,
        }
    }

    #[test]
    fn test_backoff_exponential() {
        let policy = policy();
        assert_eq!(policy.backoff(0).num_milliseconds(), 1_000);
        assert_eq!(policy.backoff(1).num_milliseconds(), 2_000);
        assert_eq!(policy.backoff(2).num_milliseconds(), 4_000);
        assert_eq!(policy.backoff(3).num_milliseconds(), 8_000);
    }

    #[test]
    fn test_backoff_capped() {
        let policy = policy();
        assert_eq!(policy.backoff(10).num_milliseconds(), 60_000);
        assert_eq!(policy.backoff(u32::MAX).num_milliseconds(), 60_000);
    }

    #[test]
    fn test_retry_without_jitter_is_exact() {
        let now = Utc::now();
        let decision = policy().decide(1, 3, FailureClass::Transient, now, 0.0);
        assert_eq!(
            decision,
            RetryDecision::RetryAt(now + Duration::milliseconds(2_000))
        );
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let now = Utc::now();
        let policy = policy();
        let low = policy.decide(2, 5, FailureClass::Transient, now, -1.0);
        let high = policy.decide(2, 5, FailureClass::Transient, now, 1.0);
        assert_eq!(low, RetryDecision::RetryAt(now + Duration::milliseconds(3_000)));
        assert_eq!(high, RetryDecision::RetryAt(now + Duration::milliseconds(5_000)));

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            match policy.decide_with_rng(2, 5, FailureClass::Transient, now, &mut rng) {
                RetryDecision::RetryAt(at) => {
                    let delay = (at - now).num_milliseconds();
                    assert!((3_000..=5_000).contains(&delay), "delay {delay}");
                }
                other => panic!("unexpected decision {other:?}"),
            }
        }
    }

    #[test]
    fn test_jittered_delay_never_exceeds_cap() {
        let now = Utc::now();
        let decision = policy().decide(20, 30, FailureClass::Transient, now, 1.0);
        assert_eq!(
            decision,
            RetryDecision::RetryAt(now + Duration::milliseconds(60_000))
        );
    }

    #[test]
    fn test_exhausted_attempts_are_dead() {
        let now = Utc::now();
        let policy = policy();
        assert!(matches!(
            policy.decide(2, 3, FailureClass::Transient, now, 0.0),
            RetryDecision::RetryAt(_)
        ));
        assert_eq!(
            policy.decide(3, 3, FailureClass::Transient, now, 0.0),
            RetryDecision::Dead(DeadReason::Exhausted)
        );
        assert_eq!(
            policy.decide(4, 3, FailureClass::Transient, now, 0.0),
            RetryDecision::Dead(DeadReason::Exhausted)
        );
    }

    #[test]
    fn test_permanent_failure_never_retried() {
        let now = Utc::now();
        assert_eq!(
            policy().decide(1, 10, FailureClass::Permanent, now, 0.0),
            RetryDecision::Dead(DeadReason::Permanent)
        );
    }
}
