//! Reconnection backoff.

use std::time::Duration;

/// Delay before the first reconnection attempt.
pub const INITIAL_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound of the reconnection delay.
pub const MAXIMUM_RETRY_INTERVAL: Duration = Duration::from_secs(3600);

/// Exponential backoff state of one connection.
///
/// The interval starts at [`INITIAL_RETRY_INTERVAL`], doubles after every
/// failed attempt up to [`MAXIMUM_RETRY_INTERVAL`] and returns to the initial
/// value after a successful reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    current: Duration,
    failures: u32,
}

impl Backoff {
    /// Creates a backoff at the initial interval.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: INITIAL_RETRY_INTERVAL,
            failures: 0,
        }
    }

    /// Delay to wait before the next attempt.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.current
    }

    /// Number of consecutive failed attempts.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a failed attempt and returns the new interval.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.current = self
            .current
            .saturating_mul(2)
            .min(MAXIMUM_RETRY_INTERVAL);
        self.current
    }

    /// Returns to the initial interval after a successful attempt.
    pub fn reset(&mut self) {
        self.current = INITIAL_RETRY_INTERVAL;
        self.failures = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
