//! Wall-clock time derived from tokio's monotonic clock.
//!
//! The wall time is read once when the clock is created. After that, "now"
//! moves with `tokio::time::Instant`. Under a paused test runtime it therefore
//! follows virtual time, so `fire_at` timestamps and timers agree.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Clock {
    anchor_wall: DateTime<Utc>,
    anchor: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// A clock that reads `wall` right now.
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall: wall,
            anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.anchor.elapsed()).unwrap_or_else(|_| TimeDelta::zero());
        self.anchor_wall + elapsed
    }

    /// How long until `at`, or `None` if `at` is not strictly in the future.
    pub fn until(&self, at: DateTime<Utc>) -> Option<Duration> {
        let now = self.now();
        if at <= now {
            return None;
        }
        (at - now).to_std().ok()
    }
}
