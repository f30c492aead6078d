//! Adaptive broadcast pacing.
//!
//! The per-room broadcast period tracks how much of the room moved since the
//! last tick: half the room or more moving halves the period down to the
//! floor, under a tenth moving doubles it up to the ceiling, anything in
//! between holds.

use std::time::Duration;

/// Per-room adaptive period state.
#[derive(Debug, Clone)]
pub struct Pacing {
    period: Duration,
    floor: Duration,
    ceiling: Duration,
}

impl Pacing {
    /// Start at the floor so new rooms broadcast promptly.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self { period: floor, floor, ceiling }
    }

    /// Current broadcast period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Adjust for one tick in which `moved` of `total` clients sent poses.
    pub fn adjust(&mut self, moved: usize, total: usize) {
        if total > 0 && moved * 2 >= total {
            self.period = (self.period / 2).max(self.floor);
        } else if total == 0 || moved * 10 < total {
            self.period = (self.period * 2).min(self.ceiling);
        }
    }
}
