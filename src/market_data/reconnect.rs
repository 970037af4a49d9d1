//! Exponential backoff with jitter for stream reconnects.
//!
//! `delay(n) = min(max_delay, base_delay * 2^n)`, then scaled by a uniform
//! factor in `[1 - jitter, 1 + jitter]`. Once `max_attempts` delays have been
//! handed out the policy reports [`FeedError::PermanentFailure`].

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FeedError, FeedResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Relative jitter, 0.2 means +/-20%.
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: 0.2,
            max_attempts: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: BackoffConfig,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Jitter-free delay for `attempt`, capped at `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Jittered delay for `attempt` using the thread rng.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = 1.0 + rng.gen_range(-jitter..=jitter);
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }

    /// Hand out the delay for the current attempt and advance the counter.
    pub fn next(&mut self) -> FeedResult<Duration> {
        if self.attempt >= self.config.max_attempts {
            warn!(attempts = self.attempt, "reconnect budget exhausted");
            return Err(FeedError::PermanentFailure { attempts: self.attempt });
        }
        let delay = self.next_delay(self.attempt);
        debug!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        self.attempt += 1;
        Ok(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn can_retry(&self) -> bool {
        self.attempt < self.config.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_base_sequence_doubles_then_caps() {
        let policy = ReconnectPolicy::default();
        let secs: Vec<u64> = (0..8).map(|n| policy.base_delay(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(policy.base_delay(200), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_within_twenty_percent() {
        let policy = ReconnectPolicy::default();
        for _ in 0..500 {
            let d = policy.next_delay(1).as_secs_f64();
            assert!((1.6..=2.4).contains(&d), "delay {d} outside +/-20% of 2s");
        }
    }

    #[test]
    fn test_exhaustion_is_permanent_failure() {
        let mut policy = ReconnectPolicy::new(BackoffConfig {
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter: 0.0,
            max_attempts: 3,
        });
        assert!(policy.next().is_ok());
        assert!(policy.next().is_ok());
        assert!(policy.next().is_ok());
        assert!(!policy.can_retry());
        assert_eq!(policy.next(), Err(FeedError::PermanentFailure { attempts: 3 }));
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut policy = ReconnectPolicy::new(BackoffConfig { jitter: 0.0, ..Default::default() });
        policy.next().unwrap();
        policy.next().unwrap();
        assert_eq!(policy.attempt(), 2);
        policy.reset();
        assert_eq!(policy.attempt(), 0);
        assert_eq!(policy.next().unwrap(), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn prop_base_delay_non_decreasing(n in 0u32..120, m in 0u32..120) {
            let policy = ReconnectPolicy::default();
            let (lo, hi) = if n <= m { (n, m) } else { (m, n) };
            prop_assert!(policy.base_delay(lo) <= policy.base_delay(hi));
            prop_assert!(policy.base_delay(hi) <= Duration::from_millis(policy.config().max_delay_ms));
        }

        #[test]
        fn prop_jittered_delay_bounded(n in 0u32..120) {
            let policy = ReconnectPolicy::default();
            let base = policy.base_delay(n).as_secs_f64();
            let d = policy.next_delay(n).as_secs_f64();
            prop_assert!(d >= base * 0.8 - 1e-9 && d <= base * 1.2 + 1e-9);
        }
    }
}
