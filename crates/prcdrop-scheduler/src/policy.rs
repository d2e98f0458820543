//! Retry and reschedule policies.
//!
//! The scheduler never hard-codes delays: every failure asks a [`RetryPolicy`]
//! what to do next, every successful no-drop check asks a [`ReschedulePolicy`].

use std::sync::Arc;
use std::time::Duration;

use prcdrop_core::config::{RetryBackoff, SchedulerConfig};

/// What to do after the n-th consecutive failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Abandon,
}

/// Bounded retry budget for failed probes.
pub trait RetryPolicy: Send + Sync {
    /// Delay before the next attempt, given the consecutive failure count (>= 1).
    fn delay(&self, failures: u32) -> Duration;

    /// Failure count at which the subscription is abandoned.
    fn max_failures(&self) -> u32;

    fn decide(&self, failures: u32) -> RetryDecision {
        if failures >= self.max_failures() {
            RetryDecision::Abandon
        } else {
            RetryDecision::RetryAfter(self.delay(failures))
        }
    }
}

/// Spacing between successful checks.
pub trait ReschedulePolicy: Send + Sync {
    fn interval(&self) -> Duration;
}

/// Same delay after every failure.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_failures: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_failures: u32) -> Self {
        Self {
            delay,
            max_failures,
        }
    }
}

impl RetryPolicy for FixedDelay {
    fn delay(&self, _failures: u32) -> Duration {
        self.delay
    }

    fn max_failures(&self) -> u32 {
        self.max_failures
    }
}

/// Doubling delay: `base * 2^(failures-1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    max_failures: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max_delay: Duration, max_failures: u32) -> Self {
        Self {
            base,
            max_delay,
            max_failures,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn delay(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn max_failures(&self) -> u32 {
        self.max_failures
    }
}

#[derive(Debug, Clone)]
pub struct FixedInterval {
    interval: Duration,
}

impl FixedInterval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl ReschedulePolicy for FixedInterval {
    fn interval(&self) -> Duration {
        self.interval
    }
}

/// Build the configured retry policy.
pub fn retry_policy(config: &SchedulerConfig) -> Arc<dyn RetryPolicy> {
    let base = Duration::from_secs(config.retry_delay_secs);
    match config.retry_backoff {
        RetryBackoff::Fixed => Arc::new(FixedDelay::new(base, config.max_failures)),
        RetryBackoff::Exponential => Arc::new(ExponentialBackoff::new(
            base,
            Duration::from_secs(config.retry_max_delay_secs),
            config.max_failures,
        )),
    }
}

/// Build the configured reschedule policy.
pub fn reschedule_policy(config: &SchedulerConfig) -> Arc<dyn ReschedulePolicy> {
    Arc::new(FixedInterval::new(Duration::from_secs(
        config.recheck_interval_secs,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_budget() {
        let p = FixedDelay::new(Duration::from_secs(300), 5);
        assert_eq!(p.decide(1), RetryDecision::RetryAfter(Duration::from_secs(300)));
        assert_eq!(p.decide(4), RetryDecision::RetryAfter(Duration::from_secs(300)));
        assert_eq!(p.decide(5), RetryDecision::Abandon);
    }

    #[test]
    fn test_exponential_doubles_and_caps() {
        let p = ExponentialBackoff::new(Duration::from_secs(60), Duration::from_secs(600), 10);
        assert_eq!(p.delay(1), Duration::from_secs(60));
        assert_eq!(p.delay(2), Duration::from_secs(120));
        assert_eq!(p.delay(4), Duration::from_secs(480));
        assert_eq!(p.delay(5), Duration::from_secs(600));
        assert_eq!(p.delay(40), Duration::from_secs(600));
    }

    #[test]
    fn test_zero_budget_abandons_immediately() {
        let p = FixedDelay::new(Duration::from_secs(1), 0);
        assert_eq!(p.decide(1), RetryDecision::Abandon);
    }

    #[test]
    fn test_policies_from_config() {
        let mut cfg = SchedulerConfig::default();
        assert_eq!(retry_policy(&cfg).delay(3), Duration::from_secs(300));
        assert_eq!(reschedule_policy(&cfg).interval(), Duration::from_secs(1200));

        cfg.retry_backoff = RetryBackoff::Exponential;
        assert_eq!(retry_policy(&cfg).delay(3), Duration::from_secs(1200));
        assert_eq!(retry_policy(&cfg).max_failures(), 5);
    }
}
