//! Sans-IO state for the roomcast relay.
//!
//! This crate owns the relay's logic with no sockets, locks, or clock reads:
//! callers pass monotonic and wall-clock time into every operation, so the
//! timing rules (inactivity reaping, adaptive pacing, room destruction) are
//! plain unit-testable functions. The server crate wraps a [`Room`] in a
//! per-room lock and executes the [`TickPlan`]s it returns.
//!
//! # Components
//!
//! - [`Room`]: client table, device-id index, verbatim pose cache, and
//!   broadcast planning
//! - [`VarMap`]: synchronized variables with last-writer-wins resolution
//! - [`Pacing`]: the adaptive broadcast period
//! - [`RelayCounters`]: shared drop/traffic counters

mod counters;
mod error;
mod pacing;
mod room;
pub mod vars;

pub use counters::{CounterSnapshot, RelayCounters};
pub use error::RelayError;
pub use pacing::Pacing;
pub use room::{
    ClientRecord, MAPPING_BROADCAST_INTERVAL, ReapedClient, Room, TickPlan,
};
pub use vars::{VarEntry, VarMap, WriteOutcome};
