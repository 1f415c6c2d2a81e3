//! Retry delay calculators.
//!
//! [`Backoff`] spaces out reconnect attempts to the control plane.
//! [`RestartBackoff`] spaces out restarts of a crash-looping sub-agent.
//! Both take an explicit random source so tests can seed them.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Upper bound of the multiplicative jitter added on top of the base delay.
const JITTER_FACTOR: f64 = 0.5;

/// Exponent cap for the restart window (2^15 ms is ~33 s).
const MAX_RESTART_EXPONENT: u32 = 15;

/// Exponential delay with jitter, clamped to `[min, max]`.
///
/// Attempt `n` (1-based) waits `min * 2^(n-1)` plus up to 50% jitter.
#[derive(Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
    rng: StdRng,
}

impl Backoff {
    /// Create a backoff seeded from the operating system.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self::with_rng(min, max, StdRng::from_os_rng())
    }

    /// Create a backoff with an explicit random source.
    pub fn with_rng(min: Duration, max: Duration, rng: StdRng) -> Self {
        Self {
            min,
            max: max.max(min),
            attempt: 0,
            rng,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let exponent = (self.attempt - 1).min(31);
        let base = self.min.saturating_mul(1 << exponent).min(self.max);
        let jitter = base.mul_f64(self.rng.random::<f64>() * JITTER_FACTOR);
        base.saturating_add(jitter).clamp(self.min, self.max)
    }

    /// Forget previous attempts; the next delay starts from `min` again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since creation or the last reset.
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Restart delay for supervised processes.
///
/// Each call to [`RestartBackoff::next_delay`] bumps the restart counter and
/// picks a random delay in `[0, 2^count - 1]` milliseconds, never below 1 ms.
/// A clean run calls [`RestartBackoff::reset`].
#[derive(Debug)]
pub struct RestartBackoff {
    count: u32,
    rng: StdRng,
}

impl RestartBackoff {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    pub const fn with_rng(rng: StdRng) -> Self {
        Self { count: 0, rng }
    }

    /// Increment the restart counter and return the delay before restarting.
    pub fn next_delay(&mut self) -> Duration {
        self.count = self.count.saturating_add(1);
        let window = self.window_millis();
        let millis = if window == 0 {
            0
        } else {
            self.rng.random_range(0..=window)
        };
        Duration::from_millis(millis.max(1))
    }

    /// Upper bound of the current delay window.
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_millis())
    }

    const fn window_millis(&self) -> u64 {
        let exponent = if self.count < MAX_RESTART_EXPONENT {
            self.count
        } else {
            MAX_RESTART_EXPONENT
        };
        (1u64 << exponent) - 1
    }

    pub const fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }

    #[test]
    fn backoff_stays_within_bounds() {
        let min = Duration::from_millis(100);
        let max = Duration::from_secs(2);
        let mut backoff = Backoff::with_rng(min, max, seeded(7));

        for _ in 0..50 {
            let delay = backoff.delay();
            assert!(delay >= min, "{delay:?} below min");
            assert!(delay <= max, "{delay:?} above max");
        }
    }

    #[test]
    fn backoff_grows_then_saturates() {
        let min = Duration::from_millis(10);
        let max = Duration::from_millis(500);
        let mut backoff = Backoff::with_rng(min, max, seeded(1));

        let first = backoff.delay();
        assert!(first < Duration::from_millis(16));

        for _ in 0..10 {
            backoff.delay();
        }
        assert_eq!(backoff.delay(), max);
    }

    #[test]
    fn backoff_reset_starts_over() {
        let min = Duration::from_millis(10);
        let max = Duration::from_secs(10);
        let mut backoff = Backoff::with_rng(min, max, seeded(3));
        for _ in 0..6 {
            backoff.delay();
        }
        assert_eq!(backoff.attempts(), 6);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.delay() < Duration::from_millis(16));
    }

    #[test]
    fn backoff_max_below_min_is_raised() {
        let mut backoff =
            Backoff::with_rng(Duration::from_secs(1), Duration::from_millis(1), seeded(0));
        assert_eq!(backoff.delay(), Duration::from_secs(1));
    }

    #[test]
    fn restart_window_grows_monotonically() {
        let mut restart = RestartBackoff::with_rng(seeded(42));
        let mut previous = Duration::ZERO;

        for count in 1..=20u32 {
            let delay = restart.next_delay();
            let window = restart.window();
            assert_eq!(restart.count(), count);
            assert!(window >= previous, "window shrank at count {count}");
            assert!(delay >= Duration::from_millis(1));
            assert!(delay <= window.max(Duration::from_millis(1)));
            previous = window;
        }
    }

    #[test]
    fn restart_reset_shrinks_window() {
        let mut restart = RestartBackoff::with_rng(seeded(9));
        for _ in 0..8 {
            restart.next_delay();
        }
        assert_eq!(restart.window(), Duration::from_millis(255));

        restart.reset();
        assert_eq!(restart.count(), 0);
        let delay = restart.next_delay();
        assert_eq!(restart.window(), Duration::from_millis(1));
        assert!(delay <= Duration::from_millis(1));
    }
}
