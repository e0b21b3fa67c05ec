//! Growing wait between reconnect attempts to the same server.
//!
//! The reconnection engine never retries a pool entry sooner than the current delay
//! after that entry's previous attempt. Every time the engine actually has to sleep
//! (all other candidates were tried more recently) the delay grows:
//!
//! ```text
//! delay[n] = min(reconnect_wait * multiplier^n, reconnect_wait_max)
//! ```
//!
//! With the default multiplier of `1.0` the wait is constant, matching a fixed
//! `reconnect_wait`. The delay resets once a session is established.
//!
//! Attempt budgets are not tracked here: each pool entry counts its own failed
//! attempts (see `pool.rs`).
//!
//! # Examples
//!
//! ```ignore
//! let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2), 2.0);
//! assert_eq!(backoff.next_sleep(), Duration::from_millis(100));
//! assert_eq!(backoff.next_sleep(), Duration::from_millis(200));
//! backoff.reset();
//! assert_eq!(backoff.current_delay(), Duration::from_millis(100));
//! ```

use std::time::Duration;

/// Exponential delay controller for reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// The delay applied after a reset.
    initial_delay: Duration,

    /// The delay returned by the next `next_sleep()` call.
    current_delay: Duration,

    /// Cap on the delay.
    max_delay: Duration,

    /// Growth factor applied after each sleep. Values below 1.0 are treated as 1.0.
    multiplier: f64,

    /// Number of sleeps since the last reset.
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff controller.
    ///
    /// # Arguments
    /// - `initial`: delay used right after a reset
    /// - `max`: cap on the delay (raised to `initial` if smaller)
    /// - `multiplier`: growth factor per sleep
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max.max(initial),
            multiplier: if multiplier.is_finite() && multiplier > 1.0 {
                multiplier
            } else {
                1.0
            },
            attempt: 0,
        }
    }

    /// Returns the delay to sleep now and advances to the next one.
    pub fn next_sleep(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let sleep = self.current_delay;

        let next_delay_secs = self.current_delay.as_secs_f64() * self.multiplier;
        self.current_delay = Duration::from_secs_f64(next_delay_secs).min(self.max_delay);

        sleep
    }

    /// Returns to the initial delay. Called once a session is established.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// The delay the next `next_sleep()` will return.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Number of sleeps since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    /// Constant two second wait, the default `reconnect_wait`.
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(2), 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_default_is_constant() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.next_sleep(), Duration::from_secs(2));
        assert_eq!(backoff.next_sleep(), Duration::from_secs(2));
        assert_eq!(backoff.attempt(), 2);
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350), 2.0);
        assert_eq!(backoff.next_sleep(), Duration::from_millis(100));
        assert_eq!(backoff.next_sleep(), Duration::from_millis(200));
        assert_eq!(backoff.next_sleep(), Duration::from_millis(350));
        assert_eq!(backoff.next_sleep(), Duration::from_millis(350));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 3.0);
        backoff.next_sleep();
        backoff.next_sleep();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_backoff_invalid_multiplier_is_constant() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 0.5);
        backoff.next_sleep();
        assert_eq!(backoff.current_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_backoff_max_below_initial() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1), 2.0);
        assert_eq!(backoff.max_delay(), Duration::from_secs(5));
    }
}
