//! Exponential reconnect backoff.

use std::time::Duration;

/// Doubling delay with a ceiling; reset to the base after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    next: Duration,
}

impl Backoff {
    /// Start at `base`, never exceeding `ceiling`.
    #[must_use]
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(base);
        Self {
            base,
            ceiling,
            next: base,
        }
    }

    /// Delay before the next attempt; doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self
            .next
            .checked_mul(2)
            .map_or(self.ceiling, |d| d.min(self.ceiling));
        delay
    }

    /// Delay the next call to [`next_delay`](Self::next_delay) will return.
    #[must_use]
    pub fn peek(&self) -> Duration {
        self.next
    }

    /// Return to the base delay.
    pub fn reset(&mut self) {
        self.next = self.base;
    }
}
