//! Reconnect delay.

use std::time::Duration;

/// Doubling reconnect delay between a floor and a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    /// Starts at `floor`.
    #[must_use]
    pub const fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Returns the delay to wait now and doubles it for next time, up to
    /// the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        if self.current < self.ceiling {
            self.current = self.current.saturating_mul(2).min(self.ceiling);
        }
        delay
    }

    /// Back to the floor after a successful connect.
    pub const fn reset(&mut self) {
        self.current = self.floor;
    }

    /// The delay [`Backoff::next_delay`] would return.
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }
}
