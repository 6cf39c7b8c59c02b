//! Redelivery policy applied by brokers when a delivery fails.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy between redeliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every redelivery
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// How often, and how quickly, a failed job is delivered again.
///
/// `max_attempts` counts deliveries, not retries: the default of 1 means a job
/// is delivered once and dead-lettered on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of deliveries allowed (minimum 1)
    pub max_attempts: u32,
    /// Base delay between deliveries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Deliver once, never redeliver.
    pub fn no_retry() -> Self {
        Self::default()
    }

    /// Up to `max_attempts` deliveries with a constant delay.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Up to `max_attempts` deliveries with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the delivery that follows failed attempt `attempt` (1-indexed),
    /// without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms(attempt) as u64)
    }

    /// [`delay_for_attempt`](Self::delay_for_attempt) spread by up to
    /// `jitter` of itself in either direction.
    ///
    /// The offset is a pure function of `seed` and `attempt`, so jobs with
    /// different seeds back off at different times while a given job's
    /// schedule stays reproducible.
    pub fn jittered_delay(&self, attempt: u32, seed: u64) -> Duration {
        let delay_ms = self.base_delay_ms(attempt);
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        if jitter_range <= 0.0 {
            return Duration::from_millis(delay_ms as u64);
        }

        let unit = mix(seed ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15)) as f64
            / u64::MAX as f64;
        let offset = jitter_range * (unit - 0.5) * 2.0;

        Duration::from_millis((delay_ms + offset).max(0.0) as u64)
    }

    /// Whether a job that has been delivered `attempts` times may be delivered again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts.max(1)
    }

    fn base_delay_ms(&self, attempt: u32) -> f64 {
        if attempt == 0 {
            return 0.0;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        }
    }
}

/// splitmix64 finaliser.
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 100,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(90), Duration::from_secs(30));
    }

    #[test]
    fn fixed_and_linear_backoff() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_millis(500));

        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            ..RetryPolicy::fixed(5, Duration::from_secs(10))
        };
        assert_eq!(linear.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn jitter_depends_on_seed_and_stays_in_range() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(60));
        let base = policy.delay_for_attempt(3);

        let delays: Vec<Duration> = (0..32u64)
            .map(|seed| policy.jittered_delay(3, seed.wrapping_mul(0xA24B_AED4_963E_E407)))
            .collect();

        for delay in &delays {
            assert!(*delay >= Duration::from_millis(3600) && *delay <= Duration::from_millis(4400));
        }
        assert!(delays.iter().any(|d| *d != delays[0]));
        assert_eq!(base, Duration::from_secs(4));
        assert_eq!(policy.jittered_delay(3, 7), policy.jittered_delay(3, 7));
    }

    #[test]
    fn zero_jitter_ignores_seed() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(250));
        assert_eq!(policy.jittered_delay(2, 1), Duration::from_millis(250));
        assert_eq!(policy.jittered_delay(2, u64::MAX), Duration::from_millis(250));
    }

    #[test]
    fn default_policy_delivers_once() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn should_retry_counts_deliveries() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
