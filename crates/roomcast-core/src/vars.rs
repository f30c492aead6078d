//! Synchronized key/value variables with last-writer-wins resolution.
//!
//! Each scope (one room's globals, or one client) is a [`VarMap`]. Writes
//! from the network may arrive reordered; the map keeps whichever write has
//! the greatest `(timestamp, writer)` under a strict total order with the
//! timestamp dominant and ties broken by the *lower* writer number. Writer 0
//! is reserved for the server's admin pre-seed path and therefore wins any
//! exact-timestamp tie.
//!
//! Cap violations are outcomes, not errors: the relay counts them and keeps
//! going, matching the drop-and-continue ingress posture.

use std::collections::{BTreeMap, BTreeSet};

use roomcast_proto::VarSyncEntry;

use crate::error::RelayError;

/// Variable names are 1..=64 UTF-8 bytes.
pub const MAX_NAME_LEN: usize = 64;
/// Variable values are up to 1024 UTF-8 bytes.
pub const MAX_VALUE_LEN: usize = 1024;
/// Distinct names per scope.
pub const MAX_VARS_PER_SCOPE: usize = 100;
/// Distinct admin-seeded names per client.
pub const MAX_ADMIN_VARS_PER_CLIENT: usize = 20;
/// Reserved writer number for the server itself.
pub const SERVER_WRITER: u16 = 0;

/// One stored variable.
#[derive(Debug, Clone, PartialEq)]
pub struct VarEntry {
    /// Stored value.
    pub value: String,
    /// Wall-clock seconds of the accepted write.
    pub timestamp: f64,
    /// Client-number of the accepted writer.
    pub writer: u16,
}

/// What happened to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was accepted and stored.
    Stored,
    /// An equal-or-newer write already holds the name. No-op.
    Stale,
    /// The scope is at its name cap and the name is new. Dropped.
    CapacityExceeded,
}

/// One scope of variables.
#[derive(Debug, Clone, Default)]
pub struct VarMap {
    entries: BTreeMap<String, VarEntry>,
    /// Names that were ever stored through the admin path.
    admin_names: BTreeSet<String>,
}

fn check_lengths(name: &str, value: &str) -> Result<(), RelayError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(RelayError::NameLength(name.len()));
    }
    if value.len() > MAX_VALUE_LEN {
        return Err(RelayError::ValueLength(value.len()));
    }
    Ok(())
}

impl VarMap {
    /// Create an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` when `(timestamp, writer)` beats the stored entry.
    fn supersedes(timestamp: f64, writer: u16, current: &VarEntry) -> bool {
        timestamp > current.timestamp
            || (timestamp == current.timestamp && writer < current.writer)
    }

    /// Apply one write under LWW rules.
    ///
    /// # Errors
    ///
    /// `NameLength` / `ValueLength` when a cap is exceeded; those writes are
    /// malformed rather than merely stale.
    pub fn write(
        &mut self,
        name: &str,
        value: &str,
        timestamp: f64,
        writer: u16,
    ) -> Result<WriteOutcome, RelayError> {
        check_lengths(name, value)?;

        if let Some(current) = self.entries.get_mut(name) {
            if !Self::supersedes(timestamp, writer, current) {
                return Ok(WriteOutcome::Stale);
            }
            *current = VarEntry { value: value.to_owned(), timestamp, writer };
            return Ok(WriteOutcome::Stored);
        }

        if self.entries.len() >= MAX_VARS_PER_SCOPE {
            return Ok(WriteOutcome::CapacityExceeded);
        }
        self.entries
            .insert(name.to_owned(), VarEntry { value: value.to_owned(), timestamp, writer });
        Ok(WriteOutcome::Stored)
    }

    /// Apply one admin pre-seed write (writer 0), tracked against the
    /// per-client admin cap.
    pub fn write_admin(
        &mut self,
        name: &str,
        value: &str,
        timestamp: f64,
    ) -> Result<WriteOutcome, RelayError> {
        check_lengths(name, value)?;
        if !self.admin_names.contains(name)
            && self.admin_names.len() >= MAX_ADMIN_VARS_PER_CLIENT
        {
            return Err(RelayError::AdminCapacity);
        }
        let outcome = self.write(name, value, timestamp, SERVER_WRITER)?;
        if outcome == WriteOutcome::Stored {
            self.admin_names.insert(name.to_owned());
        }
        Ok(outcome)
    }

    /// Look up a stored entry.
    pub fn get(&self, name: &str) -> Option<&VarEntry> {
        self.entries.get(name)
    }

    /// Number of stored names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when no names are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of names ever stored through the admin path.
    pub fn admin_len(&self) -> usize {
        self.admin_names.len()
    }

    /// Whether `name` was ever stored through the admin path.
    pub fn is_admin_name(&self, name: &str) -> bool {
        self.admin_names.contains(name)
    }

    /// Iterate entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &VarEntry)> {
        self.entries.iter()
    }

    /// All entries as wire sync entries, in name order.
    pub fn sync_entries(&self) -> Vec<VarSyncEntry> {
        self.entries
            .iter()
            .map(|(name, entry)| VarSyncEntry {
                name: name.clone(),
                value: entry.value.clone(),
                timestamp: entry.timestamp,
                writer: entry.writer,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_timestamp_wins() {
        let mut vars = VarMap::new();
        assert_eq!(vars.write("x", "old", 100.0, 5).unwrap(), WriteOutcome::Stored);
        assert_eq!(vars.write("x", "new", 101.0, 9).unwrap(), WriteOutcome::Stored);
        assert_eq!(vars.get("x").unwrap().value, "new");

        // Older write arrives late: no-op.
        assert_eq!(vars.write("x", "stale", 100.5, 1).unwrap(), WriteOutcome::Stale);
        assert_eq!(vars.get("x").unwrap().value, "new");
    }

    #[test]
    fn equal_timestamps_break_toward_lower_writer() {
        let mut vars = VarMap::new();
        assert_eq!(vars.write("x", "v1", 100.0, 7).unwrap(), WriteOutcome::Stored);
        assert_eq!(vars.write("x", "v2", 100.0, 3).unwrap(), WriteOutcome::Stored);
        assert_eq!(vars.get("x").unwrap().value, "v2");
        assert_eq!(vars.get("x").unwrap().writer, 3);

        // And the higher writer loses the same race in the other order.
        let mut vars = VarMap::new();
        assert_eq!(vars.write("x", "v2", 100.0, 3).unwrap(), WriteOutcome::Stored);
        assert_eq!(vars.write("x", "v1", 100.0, 7).unwrap(), WriteOutcome::Stale);
        assert_eq!(vars.get("x").unwrap().value, "v2");
    }

    #[test]
    fn reapplying_a_write_is_idempotent() {
        let mut vars = VarMap::new();
        vars.write("x", "v", 100.0, 4).unwrap();
        let before = vars.get("x").cloned();
        assert_eq!(vars.write("x", "v", 100.0, 4).unwrap(), WriteOutcome::Stale);
        assert_eq!(vars.get("x").cloned(), before);
    }

    #[test]
    fn scope_cap_rejects_new_names_only() {
        let mut vars = VarMap::new();
        for i in 0..MAX_VARS_PER_SCOPE {
            assert_eq!(
                vars.write(&format!("name-{i:03}"), "v", 1.0, 1).unwrap(),
                WriteOutcome::Stored
            );
        }
        assert_eq!(
            vars.write("one-too-many", "v", 1.0, 1).unwrap(),
            WriteOutcome::CapacityExceeded
        );
        assert_eq!(vars.len(), MAX_VARS_PER_SCOPE);

        // Existing names still update at the cap.
        assert_eq!(vars.write("name-000", "v2", 2.0, 1).unwrap(), WriteOutcome::Stored);
        assert_eq!(vars.get("name-000").unwrap().value, "v2");
    }

    #[test]
    fn length_caps_are_malformed() {
        let mut vars = VarMap::new();
        assert_eq!(vars.write("", "v", 1.0, 1), Err(RelayError::NameLength(0)));
        let long = "n".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(vars.write(&long, "v", 1.0, 1), Err(RelayError::NameLength(_))));
        let big = "v".repeat(MAX_VALUE_LEN + 1);
        assert!(matches!(vars.write("x", &big, 1.0, 1), Err(RelayError::ValueLength(_))));
        assert!(vars.is_empty());
    }

    #[test]
    fn admin_writes_win_ties_and_respect_their_cap() {
        let mut vars = VarMap::new();
        vars.write("x", "client", 100.0, 3).unwrap();
        // Same timestamp: writer 0 wins the tie.
        assert_eq!(vars.write_admin("x", "seeded", 100.0).unwrap(), WriteOutcome::Stored);
        assert_eq!(vars.get("x").unwrap().writer, SERVER_WRITER);

        for i in 1..MAX_ADMIN_VARS_PER_CLIENT {
            vars.write_admin(&format!("seed-{i:02}"), "v", 100.0).unwrap();
        }
        assert_eq!(vars.admin_len(), MAX_ADMIN_VARS_PER_CLIENT);
        assert_eq!(vars.write_admin("seed-20", "v", 100.0), Err(RelayError::AdminCapacity));

        // Re-seeding an existing admin name is still allowed.
        assert_eq!(vars.write_admin("x", "again", 101.0).unwrap(), WriteOutcome::Stored);
    }
}
