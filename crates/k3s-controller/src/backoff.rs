//! Capped exponential backoff for retrying lease acquisition.
use std::time::Duration;

/// Durations double from `base` on every failure until they reach `cap`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    last: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Backoff {
            base,
            cap,
            last: Duration::from_secs(0),
        }
    }

    /// Resets the strategy after a success.
    pub fn reset(&mut self) {
        self.last = Duration::from_secs(0);
    }

    /// How long to wait before the next attempt.
    pub fn next_duration(&mut self) -> Duration {
        let next = if self.last == Duration::from_secs(0) {
            self.base
        } else {
            self.last * 2
        };
        self.last = next.min(self.cap);
        self.last
    }

    /// Sleeps for [`Backoff::next_duration`].
    pub async fn wait(&mut self) {
        tokio::time::sleep(self.next_duration()).await
    }
}
