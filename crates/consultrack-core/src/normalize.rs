//! Reshapes a raw snapshot batch into log-schema rows.

use std::collections::{BTreeMap, BTreeSet};

use crate::{LogEntry, DERIVED_COLUMNS, LOG_COLUMNS};

/// One upstream record as a bag of named fields, keyed by column header.
pub type RawRecord = BTreeMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct NormalizedSnapshot {
    pub entries: Vec<LogEntry>,
    /// Expected content columns no input record carried; null-filled.
    pub missing_columns: Vec<&'static str>,
    /// Input columns outside the log schema; dropped.
    pub unknown_columns: Vec<String>,
}

/// Reindexes every raw record onto [`LOG_COLUMNS`], then computes identity and
/// fingerprint and stamps `observed_at`.
///
/// Empty cells are treated as null. Derived columns present in the input
/// (`composite_key`, `hash`, `row_chng_datetime`) are recomputed, never trusted.
pub fn normalize_snapshot(raw: &[RawRecord], observed_at: &str) -> NormalizedSnapshot {
    let seen: BTreeSet<&str> = raw
        .iter()
        .flat_map(|record| record.keys().map(String::as_str))
        .collect();

    let (missing_columns, unknown_columns) = if raw.is_empty() {
        (Vec::new(), Vec::new())
    } else {
        let missing = LOG_COLUMNS
            .iter()
            .copied()
            .filter(|column| !DERIVED_COLUMNS.contains(column) && !seen.contains(column))
            .collect();
        let unknown = seen
            .iter()
            .filter(|column| !LOG_COLUMNS.iter().any(|known| known == *column))
            .map(|column| column.to_string())
            .collect();
        (missing, unknown)
    };

    let entries = raw
        .iter()
        .map(|record| {
            let mut entry = LogEntry::default();
            for (column, value) in record {
                let value = (!value.is_empty()).then(|| value.clone());
                entry.set_content(column, value);
            }
            entry.seal(observed_at);
            entry
        })
        .collect();

    NormalizedSnapshot {
        entries,
        missing_columns,
        unknown_columns,
    }
}
