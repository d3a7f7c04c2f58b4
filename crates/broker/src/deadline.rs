//! Turn deadline handle, threaded from the orchestrator down to every
//! suspension point.

use std::time::Duration;

use tokio::time::Instant;

/// A wall-clock deadline. Copyable; pass it by value.
///
/// Built on `tokio::time::Instant` so paused-clock tests can advance
/// time deterministically.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Self {
            at: Instant::now() + duration,
        }
    }

    pub fn after_ms(ms: u64) -> Self {
        Self::after(Duration::from_millis(ms))
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}
