//! Cycle pacing.
use std::{
    thread,
    time::{Duration, Instant},
};

/// Timer to synchronize the driver thread with the virtual CPU's cycle rate.
///
/// Time spent outside of [`Clock::wait`] counts towards the next cycle.
pub struct Clock {
    start: Instant,
    period: Duration,
}

impl Clock {
    /// Creates a new clock with the current time as internal state.
    pub fn new(period: impl Into<Duration>) -> Self {
        Self {
            start: Instant::now(),
            period: period.into(),
        }
    }

    /// Set the clock state back to zero.
    pub fn reset(&mut self) {
        self.start = Instant::now()
    }

    /// Block the current thread until the next clock cycle.
    pub fn wait(&mut self) {
        while self.start.elapsed() < self.period {
            // Sleep does not have enough resolution, and spinning
            // burns a whole core. Yield instead.
            thread::yield_now();
        }

        // Reset back to zero, rather than trying to catch up.
        self.reset();
    }
}
