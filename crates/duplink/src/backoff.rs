use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

/// Exponential backoff with randomized jitter, used between dial attempts.
#[derive(Debug)]
pub(crate) struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub(crate) const fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            current: initial,
        }
    }

    pub(crate) fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.initial_delay, config.max_delay, config.backoff_factor)
    }

    /// Compute the next delay (with ±20% jitter) and advance the state.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub(crate) fn next_delay(&mut self) -> Duration {
        let current_ms = self.current.as_millis().min(u128::from(u64::MAX)) as u64;

        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        let delay = Duration::from_millis((current_ms as f64 * jitter) as u64);

        let next_ms = ((current_ms as f64 * self.factor) as u64)
            .min(self.max.as_millis().min(u128::from(u64::MAX)) as u64);
        self.current = Duration::from_millis(next_ms);

        delay
    }

    /// Reset to the initial delay after a healthy connection.
    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_delay_is_near_the_initial_value() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(5), 2.0);
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(80));
        assert!(delay <= Duration::from_millis(120));
    }

    #[test]
    fn delays_never_exceed_max_with_jitter() {
        let max = Duration::from_millis(1000);
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), max, 2.0);
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(1200), "delay {delay:?}");
        }
    }

    #[test]
    fn reset_returns_to_the_initial_range() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(5), 2.0);
        for _ in 0..8 {
            backoff.next_delay();
        }
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(80));
        assert!(delay <= Duration::from_millis(120));
    }

    #[test]
    fn huge_max_does_not_overflow() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(u64::MAX),
            2.0,
        );
        for _ in 0..100 {
            assert!(backoff.next_delay() > Duration::ZERO);
        }
    }
}
