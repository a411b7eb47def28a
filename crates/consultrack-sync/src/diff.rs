//! Classifies snapshot rows against the change log.
//!
//! The log is indexed per identity. An identity's current epoch is every row
//! after its most recent tombstone (all rows if it was never tombstoned). A
//! snapshot row is unchanged iff its fingerprint is already recorded in that
//! epoch, so a record that reappears after deletion is appended again even if
//! its content matches what it had before.

use std::collections::{HashMap, HashSet};

use consultrack_core::LogEntry;

#[derive(Debug)]
struct IdentityState<'a> {
    latest: &'a LogEntry,
    epoch_hashes: HashSet<&'a str>,
}

#[derive(Debug, Default)]
pub struct LogIndex<'a> {
    order: Vec<&'a str>,
    identities: HashMap<&'a str, IdentityState<'a>>,
}

impl<'a> LogIndex<'a> {
    pub fn build(entries: &'a [LogEntry]) -> Self {
        let mut index = Self::default();
        for entry in entries {
            let identity = entry.identity();
            let state = index.identities.entry(identity).or_insert_with(|| {
                index.order.push(identity);
                IdentityState {
                    latest: entry,
                    epoch_hashes: HashSet::new(),
                }
            });
            state.latest = entry;
            if entry.is_tombstone() {
                state.epoch_hashes.clear();
            } else {
                state.epoch_hashes.insert(entry.hash.as_str());
            }
        }
        index
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.identities.contains_key(identity)
    }

    /// Identities in first-seen log order.
    pub fn identities(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.order.iter().copied()
    }

    pub fn latest(&self, identity: &str) -> Option<&'a LogEntry> {
        self.identities.get(identity).map(|state| state.latest)
    }

    /// True when the identity's latest row is a tombstone.
    pub fn is_tombstoned(&self, identity: &str) -> bool {
        self.latest(identity).is_some_and(LogEntry::is_tombstone)
    }

    /// True when `hash` is recorded for `identity` in its current epoch.
    pub fn is_recorded(&self, identity: &str, hash: &str) -> bool {
        self.identities
            .get(identity)
            .is_some_and(|state| state.epoch_hashes.contains(hash))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffOutcome {
    /// New-or-changed rows, in snapshot order, ready to append.
    pub appended: Vec<LogEntry>,
    pub new_identities: usize,
    pub changed_identities: usize,
    pub resurrected_identities: usize,
    pub unchanged_rows: usize,
    /// Repeated `(identity, fingerprint)` pairs within the snapshot.
    pub collapsed_duplicates: usize,
}

/// Left-joins the snapshot to the log on `(identity, fingerprint)`; rows with
/// no match are new or changed. Repeats within the snapshot keep the first.
pub fn diff_snapshot(index: &LogIndex<'_>, snapshot: &[LogEntry]) -> DiffOutcome {
    let mut outcome = DiffOutcome::default();
    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    let mut counted: HashSet<&str> = HashSet::new();

    for entry in snapshot {
        let identity = entry.identity();
        if !seen.insert((identity, entry.hash.as_str())) {
            outcome.collapsed_duplicates += 1;
            continue;
        }
        if index.is_recorded(identity, &entry.hash) {
            outcome.unchanged_rows += 1;
            continue;
        }

        if counted.insert(identity) {
            if !index.contains(identity) {
                outcome.new_identities += 1;
            } else if index.is_tombstoned(identity) {
                outcome.resurrected_identities += 1;
            } else {
                outcome.changed_identities += 1;
            }
        }
        outcome.appended.push(entry.clone());
    }

    outcome
}

/// Log identities absent from the snapshot and not already tombstoned, in
/// log order. Must be evaluated against the log as loaded before this run's
/// appends.
pub fn vanished_identities<'a>(index: &LogIndex<'a>, snapshot: &[LogEntry]) -> Vec<&'a str> {
    let live: HashSet<&str> = snapshot.iter().map(LogEntry::identity).collect();
    index
        .identities()
        .filter(|identity| !live.contains(identity) && !index.is_tombstoned(identity))
        .collect()
}
