//! Doubling retry delay with a ceiling.

use std::time::Duration;

/// Accept-loop delay after the first transient error
pub const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
pub const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Reconnect delay after the first failed dial
pub const RECONNECT_BACKOFF_MIN: Duration = Duration::from_millis(100);
pub const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Exponential backoff: `min`, `2*min`, `4*min`, ... capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: None,
        }
    }

    pub fn accept() -> Self {
        Self::new(ACCEPT_BACKOFF_MIN, ACCEPT_BACKOFF_MAX)
    }

    pub fn reconnect() -> Self {
        Self::new(RECONNECT_BACKOFF_MIN, RECONNECT_BACKOFF_MAX)
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.min,
            Some(d) => (d * 2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    /// Forget accumulated delay after a success
    pub fn reset(&mut self) {
        self.current = None;
    }
}
