//! Monotonic millisecond timestamps, shared by the timing wheel, the idle
//! checker, and the ack-retransmit scanner so they all agree on "now".
//!
//! Built on `tokio::time::Instant` rather than `std::time::Instant` so that
//! tests using `tokio::time::{pause, advance}` observe the same clock the
//! production code does; outside a paused runtime it behaves identically to
//! the stdlib monotonic clock.

use tokio::time::Instant;

/// A monotonic millisecond clock anchored at construction time.
#[derive(Clone, Debug)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }

    /// Milliseconds elapsed since this clock was created.
    pub fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
