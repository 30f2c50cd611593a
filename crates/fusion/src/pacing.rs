use std::time::{Duration, Instant};

/// Fixed-cadence loop timing.
pub struct CyclePacing {
    interval: Duration,
    overruns: u64,
}

impl CyclePacing {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            overruns: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Time left in the cycle that began at `started`, or `None` if the
    /// cycle already overran its budget.
    pub fn remaining(&mut self, started: Instant) -> Option<Duration> {
        let elapsed = started.elapsed();
        if elapsed < self.interval {
            Some(self.interval - elapsed)
        } else {
            self.overruns += 1;
            tracing::trace!("Cycle took longer than its budget: {:?}", elapsed);
            None
        }
    }

    /// Sleep out the rest of the cycle that began at `started`.
    pub fn wait(&mut self, started: Instant) {
        if let Some(rest) = self.remaining(started) {
            std::thread::sleep(rest);
        }
    }
}
