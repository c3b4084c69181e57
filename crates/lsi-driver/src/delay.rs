//! Sleep abstraction for bounded polls.

use std::time::Duration;

/// Something that can wait.
pub trait Delay {
    /// Block for `d`.
    fn delay(&mut self, d: Duration);
}

/// Real sleeps via `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay(&mut self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Accumulates requested waits without sleeping.
#[derive(Debug, Default, Clone)]
pub struct RecordingDelay {
    total: Duration,
    calls: u64,
}

impl RecordingDelay {
    /// New recorder with nothing accumulated.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of every requested wait.
    pub const fn total(&self) -> Duration {
        self.total
    }

    /// Number of waits requested.
    pub const fn calls(&self) -> u64 {
        self.calls
    }
}

impl Delay for RecordingDelay {
    fn delay(&mut self, d: Duration) {
        self.total += d;
        self.calls += 1;
    }
}

impl<D: Delay + ?Sized> Delay for &mut D {
    fn delay(&mut self, d: Duration) {
        (**self).delay(d);
    }
}
