//! Reconnect policy with linear back-off.

use std::time::Duration;

/// Controls how the connection manager reconnects after a drop.
///
/// Attempt `k` (1-based) waits `base_delay * k`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    /// Maximum number of consecutive reconnect attempts before giving up.
    /// `0` means unlimited retries.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based). `0` is treated
    /// as the first attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.max(1))
    }

    /// Whether `attempts` already made exhaust the budget.
    pub fn should_give_up(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_values() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.base_delay, Duration::from_secs(5));
        assert_eq!(p.max_attempts, 10);
    }

    #[test]
    fn delay_is_linear_in_attempt() {
        let p = ReconnectPolicy::default();
        for k in 1..=10u32 {
            assert_eq!(p.delay_for_attempt(k), Duration::from_secs(5 * u64::from(k)));
        }
        assert_eq!(p.delay_for_attempt(0), Duration::from_secs(5));
    }

    #[test]
    fn should_give_up_when_limited() {
        let p = ReconnectPolicy {
            max_attempts: 5,
            ..Default::default()
        };
        assert!(!p.should_give_up(4));
        assert!(p.should_give_up(5));
        assert!(p.should_give_up(6));
    }

    #[test]
    fn unlimited_never_gives_up() {
        let p = ReconnectPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(!p.should_give_up(1_000_000));
    }

    #[test]
    fn huge_attempt_saturates() {
        let p = ReconnectPolicy {
            base_delay: Duration::from_secs(u64::MAX / 2),
            max_attempts: 0,
        };
        assert_eq!(p.delay_for_attempt(u32::MAX), Duration::MAX);
    }
}
