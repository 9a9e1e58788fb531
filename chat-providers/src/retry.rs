//! Outbox retry/backoff policy (spec §4.7, §5): exponential backoff
//! capped at a configurable ceiling, with a bounded attempt budget after
//! which a row is marked `failed` for manual remediation.
//!
//! Grounded on the donor's `RetryPolicy`/backoff shape in
//! `ethers-providers/src/transports/retry.rs`, generalized from
//! "should I retry this JSON-RPC error" to "should this outbox row get
//! another attempt, and how long until it does".

use chrono::{DateTime, Duration as ChronoDuration, Utc};

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: i32,
    pub base: std::time::Duration,
    pub cap: std::time::Duration,
}

impl BackoffPolicy {
    pub fn new(base: std::time::Duration, cap: std::time::Duration, max_attempts: i32) -> Self {
        Self { max_attempts, base, cap }
    }

    /// `base * 2^attempt`, capped (SPEC_FULL §12: defaults `base=1s`,
    /// `cap=300s`, `max_attempts=10`).
    pub fn delay_for(&self, attempt: i32) -> std::time::Duration {
        let shift = attempt.clamp(0, 30) as u32;
        let scaled = self.base.saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
        std::cmp::min(scaled, self.cap)
    }

    pub fn next_attempt_at(&self, attempt: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_for(attempt);
        now + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::seconds(1))
    }

    /// Once `attempt` reaches this, the row is marked `failed` instead of
    /// re-entering `pending` (spec §4.7).
    pub fn exhausted(&self, attempt: i32) -> bool {
        attempt >= self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(1), std::time::Duration::from_secs(300), 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy::new(
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(10),
            10,
        );
        assert_eq!(policy.delay_for(0), std::time::Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), std::time::Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), std::time::Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), std::time::Duration::from_secs(10));
    }

    #[test]
    fn exhaustion_respects_max_attempts() {
        let policy = BackoffPolicy::default();
        assert!(!policy.exhausted(9));
        assert!(policy.exhausted(10));
        assert!(policy.exhausted(11));
    }
}
