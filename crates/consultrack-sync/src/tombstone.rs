//! Synthesizes DELETED entries for identities that left the snapshot.

use consultrack_core::{LogEntry, TOMBSTONE_STATUS};

use crate::diff::LogIndex;

/// Copies the latest known state of each vanished identity, marks it
/// `DELETED`, and re-fingerprints it at `observed_at`.
///
/// `vanished` comes from [`crate::diff::vanished_identities`], which yields
/// each identity once and never one whose latest row is already a tombstone.
/// That filter, together with the run lock, is what keeps a deletion from
/// being recorded twice.
pub fn synthesize_tombstones(
    index: &LogIndex<'_>,
    vanished: &[&str],
    observed_at: &str,
) -> Vec<LogEntry> {
    vanished
        .iter()
        .filter_map(|identity| index.latest(identity))
        .map(|latest| {
            let mut tombstone = latest.clone();
            tombstone.status = Some(TOMBSTONE_STATUS.to_string());
            tombstone.restamp(observed_at);
            tombstone
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::vanished_identities;

    const NOW: &str = "2026-03-01T00:00:00.000000Z";

    fn row(reg: &str, title: &str) -> LogEntry {
        let mut entry = LogEntry {
            owner_org: Some("ec".into()),
            registration_number: Some(reg.into()),
            status: Some("O".into()),
            title_en: Some(title.into()),
            ..Default::default()
        };
        entry.seal("2026-01-01T00:00:00.000000Z");
        entry
    }

    #[test]
    fn tombstone_carries_latest_values_with_fresh_hash_and_time() {
        let log = vec![row("1", "Draft"), row("1", "Final")];
        let index = LogIndex::build(&log);
        let tombstones = synthesize_tombstones(&index, &["ec-1"], NOW);

        let tombstone = &tombstones[0];
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstone.title_en.as_deref(), Some("Final"));
        assert!(tombstone.is_tombstone());
        assert_eq!(tombstone.row_chng_datetime, NOW);
        assert_ne!(tombstone.hash, log[1].hash);
        assert_eq!(tombstone.hash, tombstone.content_fingerprint());
    }

    #[test]
    fn tombstone_keeps_stored_identity() {
        let mut legacy = row("1", "Legacy");
        legacy.composite_key = "ec-1.0".into();
        let log = vec![legacy];
        let index = LogIndex::build(&log);
        let tombstones = synthesize_tombstones(&index, &["ec-1.0"], NOW);
        assert_eq!(tombstones[0].identity(), "ec-1.0");
    }

    #[test]
    fn resurrected_identity_can_repeat_an_earlier_tombstone() {
        let live = row("1", "Only");
        let mut earlier = live.clone();
        earlier.status = Some(TOMBSTONE_STATUS.to_string());
        earlier.restamp("2026-02-01T00:00:00.000000Z");
        let mut log = vec![live.clone(), earlier.clone(), live];
        log[2].restamp("2026-02-15T00:00:00.000000Z");

        let index = LogIndex::build(&log);
        let vanished = vanished_identities(&index, &[]);
        assert_eq!(vanished, vec!["ec-1"]);

        let tombstones = synthesize_tombstones(&index, &vanished, NOW);
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].hash, earlier.hash);
        assert_eq!(tombstones[0].row_chng_datetime, NOW);
    }

    #[test]
    fn tombstoned_identity_is_not_a_candidate_again() {
        let log = vec![row("1", "Only")];
        let index = LogIndex::build(&log);
        let first = synthesize_tombstones(&index, &vanished_identities(&index, &[]), NOW);

        let mut log = log.clone();
        log.extend(first);
        let index = LogIndex::build(&log);
        let vanished = vanished_identities(&index, &[]);
        assert!(vanished.is_empty());
        assert!(synthesize_tombstones(&index, &vanished, NOW).is_empty());
    }

    #[test]
    fn unknown_identity_is_skipped() {
        let index = LogIndex::build(&[]);
        assert!(synthesize_tombstones(&index, &["nope-1"], NOW).is_empty());
    }
}
