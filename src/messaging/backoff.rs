//! Retry and reconnect schedules for the resilient client.
//!
//! `connect` walks a [`RetryPolicy`] between its attempts. Once degraded, the
//! client throttles automatic reconnects with a [`ReconnectBackoff`] that grows
//! after each failure and snaps back to its floor on success.

use std::time::Duration;

use tokio::time::Instant;

/// Delays slept between consecutive `connect` attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay following `current`, capped at `max_delay`
    pub fn next_delay(&self, current: Duration) -> Duration {
        grow(current, self.multiplier, self.max_delay)
    }

    /// Infinite sequence of delays starting at `initial_delay`
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.initial_delay.min(self.max_delay)), move |d| {
            Some(self.next_delay(*d))
        })
    }
}

/// Throttle schedule for automatic reconnects while degraded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub floor: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(5),
            multiplier: 1.5,
            cap: Duration::from_secs(30),
        }
    }
}

/// Live reconnect throttle state
#[derive(Debug)]
pub(crate) struct ReconnectBackoff {
    policy: ReconnectPolicy,
    current: Duration,
    last_attempt: Option<Instant>,
}

impl ReconnectBackoff {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current: policy.floor,
            last_attempt: None,
        }
    }

    pub(crate) fn current_delay(&self) -> Duration {
        self.current
    }

    /// Stamp a connection attempt (made by `connect` or a reconnect)
    pub(crate) fn record_attempt(&mut self) {
        self.last_attempt = Some(Instant::now());
    }

    /// More than the current delay has passed since the last attempt
    pub(crate) fn is_due(&self) -> bool {
        match self.last_attempt {
            None => true,
            Some(at) => at.elapsed() > self.current,
        }
    }

    /// Time left before the next reconnect is allowed
    pub(crate) fn remaining(&self) -> Duration {
        match self.last_attempt {
            None => Duration::ZERO,
            Some(at) => self.current.saturating_sub(at.elapsed()),
        }
    }

    pub(crate) fn on_failure(&mut self) {
        self.current = grow(self.current, self.policy.multiplier, self.policy.cap);
    }

    pub(crate) fn on_success(&mut self) {
        self.current = self.policy.floor;
    }
}

fn grow(current: Duration, multiplier: f64, cap: Duration) -> Duration {
    Duration::try_from_secs_f64(current.as_secs_f64() * multiplier)
        .unwrap_or(cap)
        .min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays_double_and_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = policy.delays().take(6).map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let mut backoff = ReconnectBackoff::new(ReconnectPolicy::default());
        assert_eq!(backoff.current_delay(), Duration::from_secs(5));

        backoff.on_failure();
        assert_eq!(backoff.current_delay(), Duration::from_millis(7_500));
        backoff.on_failure();
        assert_eq!(backoff.current_delay(), Duration::from_millis(11_250));

        for _ in 0..10 {
            backoff.on_failure();
        }
        assert_eq!(backoff.current_delay(), Duration::from_secs(30));

        backoff.on_success();
        assert_eq!(backoff.current_delay(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_due_only_after_delay() {
        let mut backoff = ReconnectBackoff::new(ReconnectPolicy::default());
        assert!(backoff.is_due());

        backoff.record_attempt();
        assert!(!backoff.is_due());
        assert_eq!(backoff.remaining(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!backoff.is_due());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(backoff.is_due());
    }
}
