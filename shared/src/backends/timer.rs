use std::time::{Duration, Instant};

/// A simple repeating interval: starts "un-rung", rings once its duration has
/// elapsed, and is manually reset after being serviced.
pub struct Timer {
    duration: Duration,
    last: Instant,
}

impl Timer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            last: Instant::now(),
        }
    }

    /// Whether the interval has elapsed since the last reset.
    pub fn ringing(&self) -> bool {
        self.last.elapsed() >= self.duration
    }

    pub fn reset(&mut self) {
        self.last = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.last.elapsed()
    }
}
