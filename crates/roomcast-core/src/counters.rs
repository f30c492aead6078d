//! Relay drop and traffic counters.
//!
//! Nothing propagates to clients across the relay, so dropped or rejected
//! traffic is only visible here: through periodic log lines and the admin
//! stats endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counters, bumped with relaxed ordering from every thread.
#[derive(Debug, Default)]
pub struct RelayCounters {
    /// Units dropped for framing, length, or content-cap violations.
    pub malformed_frames: AtomicU64,
    /// Well-formed messages of a type the ingress side never accepts.
    pub unroutable_messages: AtomicU64,
    /// Pose uploads dropped for a stale sequence number.
    pub stale_poses: AtomicU64,
    /// Variable writes superseded by an already-stored entry.
    pub stale_var_writes: AtomicU64,
    /// Variable writes dropped at a scope's name cap.
    pub capacity_rejects: AtomicU64,
    /// Publish-side messages dropped at a subscriber's high-water mark.
    pub dropped_publishes: AtomicU64,
    /// Clients removed by the inactivity reaper.
    pub reaped_clients: AtomicU64,
    /// Rooms destroyed after emptying out.
    pub destroyed_rooms: AtomicU64,
    /// Pose uploads accepted into the cache.
    pub relayed_poses: AtomicU64,
    /// RPC messages re-published or delivered to the server sink.
    pub relayed_rpcs: AtomicU64,
}

/// Point-in-time copy of [`RelayCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// See [`RelayCounters::malformed_frames`].
    pub malformed_frames: u64,
    /// See [`RelayCounters::unroutable_messages`].
    pub unroutable_messages: u64,
    /// See [`RelayCounters::stale_poses`].
    pub stale_poses: u64,
    /// See [`RelayCounters::stale_var_writes`].
    pub stale_var_writes: u64,
    /// See [`RelayCounters::capacity_rejects`].
    pub capacity_rejects: u64,
    /// See [`RelayCounters::dropped_publishes`].
    pub dropped_publishes: u64,
    /// See [`RelayCounters::reaped_clients`].
    pub reaped_clients: u64,
    /// See [`RelayCounters::destroyed_rooms`].
    pub destroyed_rooms: u64,
    /// See [`RelayCounters::relayed_poses`].
    pub relayed_poses: u64,
    /// See [`RelayCounters::relayed_rpcs`].
    pub relayed_rpcs: u64,
}

impl RelayCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            unroutable_messages: self.unroutable_messages.load(Ordering::Relaxed),
            stale_poses: self.stale_poses.load(Ordering::Relaxed),
            stale_var_writes: self.stale_var_writes.load(Ordering::Relaxed),
            capacity_rejects: self.capacity_rejects.load(Ordering::Relaxed),
            dropped_publishes: self.dropped_publishes.load(Ordering::Relaxed),
            reaped_clients: self.reaped_clients.load(Ordering::Relaxed),
            destroyed_rooms: self.destroyed_rooms.load(Ordering::Relaxed),
            relayed_poses: self.relayed_poses.load(Ordering::Relaxed),
            relayed_rpcs: self.relayed_rpcs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let counters = RelayCounters::new();
        RelayCounters::bump(&counters.malformed_frames);
        RelayCounters::bump(&counters.malformed_frames);
        RelayCounters::bump(&counters.relayed_poses);

        let snap = counters.snapshot();
        assert_eq!(snap.malformed_frames, 2);
        assert_eq!(snap.relayed_poses, 1);
        assert_eq!(snap.dropped_publishes, 0);
    }
}
