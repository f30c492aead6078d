//! Per-room client table, pose cache, and broadcast planning.
//!
//! A [`Room`] owns everything the relay knows about one session: the
//! client-number table with its device-id reverse index, the verbatim pose
//! body cache, both variable scopes, and the adaptive broadcast pacing.
//! It performs no I/O and never reads the clock; callers pass time in, which
//! keeps every timing rule unit-testable.
//!
//! The broadcaster drives a room through [`Room::tick`], which returns a
//! [`TickPlan`] of everything to emit. Reaping, room destruction, mapping
//! cadence, and variable-sync flushing are all decided here so the egress
//! side stays a thin executor.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::{Duration, Instant},
};

use bytes::Bytes;
use roomcast_proto::{ClientVarBlock, MappingEntry, VarSyncEntry};

use crate::{
    error::RelayError,
    pacing::Pacing,
    vars::{MAX_ADMIN_VARS_PER_CLIENT, MAX_VARS_PER_SCOPE, VarMap, WriteOutcome},
};

/// Mapping broadcasts are refreshed every this many pose broadcasts, on top
/// of the immediate refresh after any join or reap.
pub const MAPPING_BROADCAST_INTERVAL: u64 = 10;

/// One tracked client.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Stable client-chosen identity.
    pub device_id: String,
    /// Number bound to this client within the room.
    pub client_no: u16,
    /// Monotonic time of the last frame from this client.
    pub last_seen: Instant,
    /// Whether the latest cached pose is the invisible sentinel.
    pub stealth: bool,
    /// Verbatim bytes of the most recently accepted pose body.
    pub pose: Option<Bytes>,
    /// Sequence number of the most recently accepted pose upload.
    pub last_sequence: Option<u32>,
}

/// A client removed by the reaper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedClient {
    /// Number the client held.
    pub client_no: u16,
    /// The client's device identity.
    pub device_id: String,
}

/// Everything one broadcast tick decided to do for a room.
#[derive(Debug, Default)]
pub struct TickPlan {
    /// Clients removed this tick.
    pub reaped: Vec<ReapedClient>,
    /// The room emptied out long enough ago and should be dropped.
    pub destroy_room: bool,
    /// Pose fan-out: cached bodies in ascending client-number order.
    pub pose: Option<Vec<(u16, Bytes)>>,
    /// Device-id mapping fan-out, when due.
    pub mapping: Option<Vec<MappingEntry>>,
    /// Room-scope variable entries to sync.
    pub global_sync: Vec<VarSyncEntry>,
    /// Client-scope variable blocks to sync.
    pub client_sync: Vec<ClientVarBlock>,
}

/// State of one logical session.
#[derive(Debug)]
pub struct Room {
    clients: BTreeMap<u16, ClientRecord>,
    by_device: HashMap<String, u16>,
    /// Rolling allocation cursor; skips 0 and bound numbers.
    cursor: u16,
    /// Clients with a new pose since the last broadcast.
    moved: BTreeSet<u16>,
    pacing: Pacing,
    last_broadcast: Option<Instant>,
    /// Pose broadcasts emitted, for the mapping cadence.
    broadcast_count: u64,
    /// A join or reap happened since the last emission.
    membership_changed: bool,
    /// A client joined and still needs a full variable sync.
    full_sync_due: bool,
    /// Consecutive reap passes the room has been empty.
    empty_passes: u32,
    globals: VarMap,
    /// Keyed by client-number. Entries outlive their client until the room
    /// is destroyed, so late readers still converge.
    client_vars: BTreeMap<u16, VarMap>,
    /// Admin pre-seeds for devices that have not joined yet.
    pending_preseeds: HashMap<String, VarMap>,
    dirty_globals: BTreeSet<String>,
    dirty_client_vars: BTreeMap<u16, BTreeSet<String>>,
}

impl Room {
    /// Create an empty room with the given pacing bounds.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            clients: BTreeMap::new(),
            by_device: HashMap::new(),
            cursor: 1,
            moved: BTreeSet::new(),
            pacing: Pacing::new(floor, ceiling),
            last_broadcast: None,
            broadcast_count: 0,
            membership_changed: false,
            full_sync_due: false,
            empty_passes: 0,
            globals: VarMap::new(),
            client_vars: BTreeMap::new(),
            pending_preseeds: HashMap::new(),
            dirty_globals: BTreeSet::new(),
            dirty_client_vars: BTreeMap::new(),
        }
    }

    /// Bind `device_id` to a client-number, reusing its existing binding.
    ///
    /// Returns the number and whether the binding is new. New bindings drain
    /// any pending admin pre-seeds for the device.
    pub fn upsert_client(
        &mut self,
        device_id: &str,
        now: Instant,
    ) -> Result<(u16, bool), RelayError> {
        if let Some(&client_no) = self.by_device.get(device_id) {
            if let Some(record) = self.clients.get_mut(&client_no) {
                record.last_seen = now;
            }
            return Ok((client_no, false));
        }

        let client_no = self.allocate()?;
        self.clients.insert(client_no, ClientRecord {
            device_id: device_id.to_owned(),
            client_no,
            last_seen: now,
            stealth: false,
            pose: None,
            last_sequence: None,
        });
        self.by_device.insert(device_id.to_owned(), client_no);
        self.membership_changed = true;
        self.full_sync_due = true;
        self.empty_passes = 0;

        if let Some(seeded) = self.pending_preseeds.remove(device_id) {
            let vars = self.client_vars.entry(client_no).or_default();
            let dirty = self.dirty_client_vars.entry(client_no).or_default();
            for (name, entry) in seeded.iter() {
                // Replayed through LWW so a faster client write still wins.
                if vars.write_admin(name, &entry.value, entry.timestamp)
                    == Ok(WriteOutcome::Stored)
                {
                    dirty.insert(name.clone());
                }
            }
        }

        Ok((client_no, true))
    }

    fn allocate(&mut self) -> Result<u16, RelayError> {
        if self.clients.len() >= usize::from(u16::MAX) {
            return Err(RelayError::RoomFull);
        }
        loop {
            let candidate = self.cursor;
            self.cursor = if self.cursor == u16::MAX { 1 } else { self.cursor + 1 };
            if !self.clients.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Refresh a client's last-seen time.
    pub fn touch(&mut self, client_no: u16, now: Instant) {
        if let Some(record) = self.clients.get_mut(&client_no) {
            record.last_seen = now;
        }
    }

    /// Install a new cached pose body for a client.
    ///
    /// Returns `false` when the upload's sequence number is not newer than
    /// the cached one (serial arithmetic, so counter wrap is tolerated; a
    /// mid-session restart re-binds after the reap and starts clean).
    pub fn cache_pose_body(
        &mut self,
        client_no: u16,
        body: Bytes,
        stealth: bool,
        sequence: u32,
    ) -> bool {
        let Some(record) = self.clients.get_mut(&client_no) else {
            return false;
        };
        if let Some(last) = record.last_sequence {
            let ahead = sequence.wrapping_sub(last);
            if ahead == 0 || ahead > u32::MAX / 2 {
                return false;
            }
        }
        record.last_sequence = Some(sequence);
        record.pose = Some(body);
        record.stealth = stealth;
        self.moved.insert(client_no);
        true
    }

    /// Cached bodies in ascending client-number order.
    pub fn snapshot(&self) -> Vec<(u16, Bytes)> {
        self.clients
            .iter()
            .filter_map(|(client_no, record)| {
                record.pose.clone().map(|body| (*client_no, body))
            })
            .collect()
    }

    /// Mapping entries for every live client, in client-number order.
    pub fn mapping_entries(&self) -> Vec<MappingEntry> {
        self.clients
            .values()
            .map(|record| MappingEntry {
                client_no: record.client_no,
                stealth: record.stealth,
                device_id: record.device_id.clone(),
            })
            .collect()
    }

    /// Remove every client not seen within `timeout`.
    ///
    /// Per-client variables are kept; they die with the room.
    pub fn reap_stale(&mut self, now: Instant, timeout: Duration) -> Vec<ReapedClient> {
        let stale: Vec<u16> = self
            .clients
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_seen) > timeout)
            .map(|(client_no, _)| *client_no)
            .collect();

        let mut reaped = Vec::with_capacity(stale.len());
        for client_no in stale {
            if let Some(record) = self.clients.remove(&client_no) {
                self.by_device.remove(&record.device_id);
                self.moved.remove(&client_no);
                self.membership_changed = true;
                reaped.push(ReapedClient { client_no, device_id: record.device_id });
            }
        }
        reaped
    }

    /// Write a room-scope variable.
    pub fn set_global(
        &mut self,
        name: &str,
        value: &str,
        timestamp: f64,
        writer: u16,
    ) -> Result<WriteOutcome, RelayError> {
        let outcome = self.globals.write(name, value, timestamp, writer)?;
        if outcome == WriteOutcome::Stored {
            self.dirty_globals.insert(name.to_owned());
        }
        Ok(outcome)
    }

    /// Write a client-scope variable for `target`.
    pub fn set_client_var(
        &mut self,
        target: u16,
        name: &str,
        value: &str,
        timestamp: f64,
        writer: u16,
    ) -> Result<WriteOutcome, RelayError> {
        let outcome =
            self.client_vars.entry(target).or_default().write(name, value, timestamp, writer)?;
        if outcome == WriteOutcome::Stored {
            self.dirty_client_vars.entry(target).or_default().insert(name.to_owned());
        }
        Ok(outcome)
    }

    /// Apply a batch of admin pre-seeds for `device_id` atomically.
    ///
    /// The whole batch is validated against the length, scope, and admin
    /// caps before anything is written, so a rejected request leaves the
    /// room untouched.
    pub fn preseed(
        &mut self,
        device_id: &str,
        entries: &[(String, String)],
        wall_now: f64,
    ) -> Result<(), RelayError> {
        if entries.is_empty() {
            return Ok(());
        }
        let target = self.by_device.get(device_id).copied();
        let existing = match target {
            Some(client_no) => self.client_vars.get(&client_no),
            None => self.pending_preseeds.get(device_id),
        };

        let mut new_admin = 0;
        let mut new_names = 0;
        for (name, value) in entries {
            if name.is_empty() || name.len() > crate::vars::MAX_NAME_LEN {
                return Err(RelayError::NameLength(name.len()));
            }
            if value.len() > crate::vars::MAX_VALUE_LEN {
                return Err(RelayError::ValueLength(value.len()));
            }
            if existing.is_none_or(|vars| !vars.is_admin_name(name)) {
                new_admin += 1;
            }
            if existing.is_none_or(|vars| vars.get(name).is_none()) {
                new_names += 1;
            }
        }
        let (admin_held, names_held) =
            existing.map_or((0, 0), |vars| (vars.admin_len(), vars.len()));
        if admin_held + new_admin > MAX_ADMIN_VARS_PER_CLIENT {
            return Err(RelayError::AdminCapacity);
        }
        if names_held + new_names > MAX_VARS_PER_SCOPE {
            return Err(RelayError::ScopeCapacity);
        }

        let vars = match target {
            Some(client_no) => self.client_vars.entry(client_no).or_default(),
            None => self.pending_preseeds.entry(device_id.to_owned()).or_default(),
        };
        for (name, value) in entries {
            let outcome = vars.write_admin(name, value, wall_now)?;
            if outcome == WriteOutcome::Stored
                && let Some(client_no) = target
            {
                self.dirty_client_vars.entry(client_no).or_default().insert(name.clone());
            }
        }
        Ok(())
    }

    /// Run one broadcast tick.
    ///
    /// Always reaps. Emission happens when the adaptive period has elapsed
    /// or membership changed; a pose fan-out is included when anything moved
    /// or membership changed, so departures become visible as an emptier
    /// snapshot.
    pub fn tick(&mut self, now: Instant, inactivity_timeout: Duration) -> TickPlan {
        let mut plan = TickPlan {
            reaped: self.reap_stale(now, inactivity_timeout),
            ..TickPlan::default()
        };
        plan.destroy_room = self.note_empty_pass();
        if plan.destroy_room {
            return plan;
        }

        let period_elapsed = self
            .last_broadcast
            .is_none_or(|at| now.duration_since(at) >= self.pacing.period());
        if !period_elapsed && !self.membership_changed {
            return plan;
        }
        self.last_broadcast = Some(now);

        let moved = self.moved.len();
        let total = self.clients.len();

        if moved > 0 || self.membership_changed {
            plan.pose = Some(self.snapshot());
            self.moved.clear();
            self.broadcast_count += 1;
            if self.membership_changed
                || self.broadcast_count % MAPPING_BROADCAST_INTERVAL == 0
            {
                plan.mapping = Some(self.mapping_entries());
            }
            self.membership_changed = false;
        }

        self.pacing.adjust(moved, total);

        if self.full_sync_due {
            self.full_sync_due = false;
            self.dirty_globals.clear();
            self.dirty_client_vars.clear();
            plan.global_sync = self.globals.sync_entries();
            plan.client_sync = self
                .client_vars
                .iter()
                .filter(|(_, vars)| !vars.is_empty())
                .map(|(client_no, vars)| ClientVarBlock {
                    client_no: *client_no,
                    entries: vars.sync_entries(),
                })
                .collect();
        } else {
            plan.global_sync = self.drain_dirty_globals();
            plan.client_sync = self.drain_dirty_client_vars();
        }

        plan
    }

    fn note_empty_pass(&mut self) -> bool {
        // Undelivered admin pre-seeds keep the room alive so a device can
        // still claim them on its first join.
        if self.clients.is_empty() && self.pending_preseeds.is_empty() {
            self.empty_passes += 1;
            self.empty_passes >= 2
        } else {
            self.empty_passes = 0;
            false
        }
    }

    fn drain_dirty_globals(&mut self) -> Vec<VarSyncEntry> {
        let names = std::mem::take(&mut self.dirty_globals);
        names
            .into_iter()
            .filter_map(|name| {
                self.globals.get(&name).map(|entry| VarSyncEntry {
                    name,
                    value: entry.value.clone(),
                    timestamp: entry.timestamp,
                    writer: entry.writer,
                })
            })
            .collect()
    }

    fn drain_dirty_client_vars(&mut self) -> Vec<ClientVarBlock> {
        let dirty = std::mem::take(&mut self.dirty_client_vars);
        dirty
            .into_iter()
            .filter_map(|(client_no, names)| {
                let vars = self.client_vars.get(&client_no)?;
                let entries: Vec<VarSyncEntry> = names
                    .into_iter()
                    .filter_map(|name| {
                        vars.get(&name).map(|entry| VarSyncEntry {
                            name,
                            value: entry.value.clone(),
                            timestamp: entry.timestamp,
                            writer: entry.writer,
                        })
                    })
                    .collect();
                if entries.is_empty() { None } else { Some(ClientVarBlock { client_no, entries }) }
            })
            .collect()
    }

    /// Number of live clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// `true` when no clients are bound.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Look up the number bound to a device.
    pub fn client_no_for_device(&self, device_id: &str) -> Option<u16> {
        self.by_device.get(device_id).copied()
    }

    /// Look up a live client record.
    pub fn client(&self, client_no: u16) -> Option<&ClientRecord> {
        self.clients.get(&client_no)
    }

    /// Room-scope variables.
    pub fn globals(&self) -> &VarMap {
        &self.globals
    }

    /// Variables of one client-number, live or reaped.
    pub fn client_vars(&self, client_no: u16) -> Option<&VarMap> {
        self.client_vars.get(&client_no)
    }

    /// Current adaptive broadcast period.
    pub fn broadcast_period(&self) -> Duration {
        self.pacing.period()
    }
}
