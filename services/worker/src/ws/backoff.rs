//! Reconnect backoff: `min(max_delay, base * 2^retries) + jitter`.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random delay added to every wait.
    pub max_jitter: Duration,
    /// Consecutive failures tolerated before giving up.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_jitter: Duration::from_millis(250),
            max_retries: 5,
        }
    }
}

/// Tracks consecutive connection failures for one connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    retries: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, retries: 0 }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Delay before the next attempt, without jitter.
    pub fn base_delay(&self) -> Duration {
        let factor = 1u32.checked_shl(self.retries.min(31)).unwrap_or(u32::MAX);
        self.policy
            .base_delay
            .saturating_mul(factor)
            .min(self.policy.max_delay)
    }

    /// Delay before the next attempt, with jitter applied.
    pub fn next_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.policy.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::random_range(0..=jitter_ms)
        };
        self.base_delay() + Duration::from_millis(jitter)
    }

    /// Records a failed attempt. Returns `false` once the retry budget is spent.
    pub fn record_failure(&mut self) -> bool {
        self.retries = self.retries.saturating_add(1);
        self.retries < self.policy.max_retries
    }

    /// Called after a successful handshake.
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    pub fn exhausted(&self) -> bool {
        self.retries >= self.policy.max_retries
    }
}
