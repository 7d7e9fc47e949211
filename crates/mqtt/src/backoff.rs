//! Retry pacing for broker connections.
//!
//! Two strategies live here:
//!
//! - [`Jitter`]: a uniformly random delay between a floor and a ceiling,
//!   used by the foreground connect loop between attempts so a fleet of
//!   devices does not reconnect in lockstep after a backend outage.
//! - [`Backoff`]: an exponential delay used by the network task when an
//!   established session drops and the event loop reconnects on its own.
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! # Examples
//!
//! ```ignore
//! use std::time::Duration;
//! use iotc_mqtt::backoff::{Backoff, Jitter};
//!
//! let jitter = Jitter::new(Duration::from_secs(1), Duration::from_secs(15));
//! let pause = jitter.next_sleep();
//! assert!(pause >= Duration::from_secs(1) && pause <= Duration::from_secs(15));
//!
//! let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(16), 1.5);
//! assert_eq!(backoff.next_sleep(), Duration::from_secs(1));
//! backoff.reset();
//! ```

use std::time::Duration;

use rand::Rng;

/// Uniform random delay in `[min, max)`.
///
/// When `max <= min` the delay is always `min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jitter {
    min: Duration,
    max: Duration,
}

impl Jitter {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// Jitter between one second and `max_secs` seconds.
    pub fn from_max_secs(max_secs: u64) -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(max_secs))
    }

    /// Draws the next pause, millisecond granularity.
    pub fn next_sleep(&self) -> Duration {
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        if max_ms <= min_ms {
            return self.min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..max_ms))
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

/// Exponential backoff controller for the network task's reconnects.
///
/// Each failed reconnect calls [`Backoff::next_sleep`]; a successful CONNACK
/// calls [`Backoff::reset`].
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff growing from `initial` by `multiplier` up to `max`.
    ///
    /// A multiplier at or below 1.0 yields a constant `initial` delay.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max.max(initial),
            multiplier,
            attempt: 0,
        }
    }

    /// Backoff matching a foreground connect timeout: 1s growing by half
    /// each attempt, capped at `timeout / 2 + 1` seconds.
    pub fn for_connect_timeout(timeout: Duration) -> Self {
        let cap = Duration::from_secs(timeout.as_secs() / 2 + 1);
        Self::new(Duration::from_secs(1), cap, 1.5)
    }

    /// Resets to the initial delay; call after a successful connection.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the next sleep duration and advances the schedule. The
    /// schedule never runs out; the network task retries until cancelled.
    pub fn next_sleep(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let sleep = self.current_delay;

        if self.multiplier > 1.0 {
            let next_delay_secs = self.current_delay.as_secs_f64() * self.multiplier;
            self.current_delay = Duration::from_secs_f64(next_delay_secs).min(self.max_delay);
        }

        sleep
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

impl Default for Backoff {
    /// 1s initial, 1.5x growth, 16s cap (a 30s connect timeout).
    fn default() -> Self {
        Self::for_connect_timeout(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_in_bounds() {
        let jitter = Jitter::from_max_secs(15);
        for _ in 0..200 {
            let pause = jitter.next_sleep();
            assert!(pause >= Duration::from_secs(1));
            assert!(pause < Duration::from_secs(15));
        }
    }

    #[test]
    fn test_jitter_degenerate_range_returns_min() {
        let jitter = Jitter::from_max_secs(1);
        assert_eq!(jitter.next_sleep(), Duration::from_secs(1));

        let inverted = Jitter::new(Duration::from_secs(5), Duration::from_secs(2));
        assert_eq!(inverted.next_sleep(), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_default_creation() {
        let backoff = Backoff::default();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current_delay(), Duration::from_secs(1));
        assert_eq!(backoff.max_delay(), Duration::from_secs(16));
    }

    #[test]
    fn test_backoff_next_sleep_progression() {
        let mut backoff = Backoff::default();

        let delay1 = backoff.next_sleep();
        assert_eq!(delay1, Duration::from_secs(1));

        let delay2 = backoff.next_sleep();
        assert_eq!(delay2, Duration::from_millis(1500));
    }

    #[test]
    fn test_backoff_respects_max_delay() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 2.0);

        let mut last_delay = Duration::ZERO;
        for _ in 0..20 {
            last_delay = backoff.next_sleep();
        }

        assert_eq!(last_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::default();

        backoff.next_sleep();
        backoff.next_sleep();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_keeps_going_at_cap() {
        let mut backoff = Backoff::for_connect_timeout(Duration::from_secs(4));
        for _ in 0..1000 {
            backoff.next_sleep();
        }
        assert_eq!(backoff.attempt(), 1000);
        assert_eq!(backoff.next_sleep(), Duration::from_secs(3));
    }

    #[test]
    fn test_backoff_flat_multiplier() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(10), 0.9);
        assert_eq!(backoff.next_sleep(), Duration::from_secs(2));
        assert_eq!(backoff.next_sleep(), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_cap_follows_connect_timeout() {
        let backoff = Backoff::for_connect_timeout(Duration::from_secs(10));
        assert_eq!(backoff.max_delay(), Duration::from_secs(6));
    }
}
