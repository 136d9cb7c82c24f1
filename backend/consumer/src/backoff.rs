//! Poll backoff between empty claims.
//!
//! The wait doubles with every consecutive empty claim up to a ceiling. With
//! jitter on, each wait is drawn uniformly from the upper half of the
//! current step so idle workers drift apart instead of polling in lockstep.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use queueforge_core::QueueConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Wait after the first empty claim, in milliseconds.
    pub base_delay_ms: u64,
    /// Ceiling for any single wait, in milliseconds.
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for BackoffPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            base_delay_ms: config.poll_interval_ms,
            max_delay_ms: config.max_poll_interval_ms.max(config.poll_interval_ms),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Upper bound of the wait after `empty_polls` consecutive empty claims.
    pub fn ceiling_for(&self, empty_polls: u32) -> u64 {
        let Some(doublings) = empty_polls.checked_sub(1) else {
            return 0;
        };
        1u64.checked_shl(doublings)
            .and_then(|factor| self.base_delay_ms.checked_mul(factor))
            .unwrap_or(u64::MAX)
            .min(self.max_delay_ms)
    }

    pub fn delay_for(&self, empty_polls: u32) -> Duration {
        let ceiling = self.ceiling_for(empty_polls);
        let millis = if self.jitter && ceiling > 1 {
            rand::thread_rng().gen_range(ceiling / 2..=ceiling)
        } else {
            ceiling
        };
        Duration::from_millis(millis)
    }
}

/// Per-worker backoff state.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    policy: BackoffPolicy,
    empty_polls: u32,
}

impl PollBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            empty_polls: 0,
        }
    }

    /// Record an empty claim and return how long to wait before the next one.
    pub fn next_delay(&mut self) -> Duration {
        self.empty_polls = self.empty_polls.saturating_add(1);
        self.policy.delay_for(self.empty_polls)
    }

    /// A claim succeeded; the next empty claim starts from the base delay.
    pub fn reset(&mut self) {
        self.empty_polls = 0;
    }

    pub fn empty_polls(&self) -> u32 {
        self.empty_polls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter,
        }
    }

    #[test]
    fn doubles_until_the_ceiling() {
        let p = policy(false);
        let waits: Vec<u64> = (0..7).map(|n| p.delay_for(n).as_millis() as u64).collect();
        assert_eq!(waits, vec![0, 100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn huge_poll_counts_saturate() {
        let p = policy(false);
        assert_eq!(p.ceiling_for(64), 1_000);
        assert_eq!(p.ceiling_for(u32::MAX), 1_000);
    }

    #[test]
    fn jitter_stays_in_upper_half() {
        let p = policy(true);
        for n in 1..12 {
            let ceiling = p.ceiling_for(n);
            for _ in 0..20 {
                let wait = p.delay_for(n).as_millis() as u64;
                assert!(wait >= ceiling / 2 && wait <= ceiling, "{wait} outside [{}, {ceiling}]", ceiling / 2);
            }
        }
    }

    #[test]
    fn reset_returns_to_base_delay() {
        let mut backoff = PollBackoff::new(policy(false));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.empty_polls(), 2);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn policy_from_config() {
        let config = QueueConfig {
            poll_interval_ms: 100,
            max_poll_interval_ms: 50,
            ..Default::default()
        };
        let policy = BackoffPolicy::from(&config);
        assert_eq!(policy.base_delay_ms, 100);
        assert_eq!(policy.max_delay_ms, 100);
        assert!(policy.jitter);
    }
}
