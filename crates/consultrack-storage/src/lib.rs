//! Durable change-log storage and snapshot acquisition for consultrack.
//!
//! [`LogStore`] is the only component that mutates persistent state. Every
//! write goes through a sibling temp file that is synced and renamed over the
//! target, so a failed run never leaves a truncated or half-headered file.

mod fetch;
mod snapshot;

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use consultrack_core::{change_timestamp, LogEntry, LOG_COLUMNS, LOG_SCHEMA_VERSION};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use snapshot::{decode_snapshot, fetch_snapshot, SnapshotSource};

pub const CRATE_NAME: &str = "consultrack-storage";

#[derive(Debug, Error)]
pub enum LogError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("change log is locked by another run ({0}); remove the lock file if no run is active")]
    Locked(PathBuf),

    #[error("header of {path} does not match log schema v{version} (found {found:?}); run `consultrack migrate`")]
    SchemaDrift {
        path: PathBuf,
        version: u32,
        found: Vec<String>,
    },

    #[error("migration would drop non-empty values in columns {columns:?}; pass --allow-drop to proceed")]
    MigrationWouldDrop { columns: Vec<String> },
}

pub type Result<T, E = LogError> = std::result::Result<T, E>;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> LogError + '_ {
    move |source| LogError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_error(path: &Path) -> impl FnOnce(csv::Error) -> LogError + '_ {
    move |source| LogError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

/// The change log as read from disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeLog {
    pub entries: Vec<LogEntry>,
    /// Header found on disk; `None` when the file is absent or empty.
    pub header: Option<Vec<String>>,
}

impl ChangeLog {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn header_is_current(&self) -> bool {
        self.header
            .as_ref()
            .map_or(true, |header| header.iter().eq(LOG_COLUMNS.iter()))
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(|entry| entry.is_tombstone())
    }

    /// Latest entry per identity, skipping identities whose latest entry is a
    /// tombstone. Identities keep their first-seen order.
    pub fn live_view(&self) -> Vec<LogEntry> {
        let mut order: Vec<&str> = Vec::new();
        let mut latest: HashMap<&str, &LogEntry> = HashMap::new();
        for entry in &self.entries {
            if latest.insert(entry.identity(), entry).is_none() {
                order.push(entry.identity());
            }
        }
        order
            .into_iter()
            .filter_map(|identity| latest.get(identity).copied())
            .filter(|entry| !entry.is_tombstone())
            .cloned()
            .collect()
    }

    /// All entries for one identity, newest first.
    pub fn history(&self, identity: &str) -> Vec<&LogEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| entry.identity() == identity)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationReport {
    NotNeeded,
    Migrated {
        rows: usize,
        backup_path: PathBuf,
        null_filled_columns: Vec<String>,
        dropped_columns: Vec<String>,
    },
}

/// Exclusive lock over one change log for the duration of a run.
///
/// Released (lock file removed) on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogStore {
    log_path: PathBuf,
    deleted_view_path: PathBuf,
}

impl LogStore {
    pub fn new(log_path: impl Into<PathBuf>, deleted_view_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            deleted_view_path: deleted_view_path.into(),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn deleted_view_path(&self) -> &Path {
        &self.deleted_view_path
    }

    pub fn lock_path(&self) -> PathBuf {
        with_suffix(&self.log_path, ".lock")
    }

    /// Takes the run lock, failing fast if another run holds it.
    pub fn lock(&self) -> Result<RunLock> {
        let path = self.lock_path();
        ensure_parent(&path)?;
        match OpenOptions::new().create_new(true).write(true).open(&path) {
            Ok(mut file) => {
                let stamp = change_timestamp(Utc::now());
                writeln!(file, "pid={} acquired_at={stamp}", std::process::id())
                    .map_err(io_error(&path))?;
                debug!(path = %path.display(), "run lock acquired");
                Ok(RunLock { path })
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(LogError::Locked(path)),
            Err(source) => Err(LogError::Io { path, source }),
        }
    }

    /// Reads the full log. A missing or zero-byte file is an empty log.
    pub fn load(&self) -> Result<ChangeLog> {
        let bytes = self.read_existing()?;
        parse_log(&bytes, &self.log_path)
    }

    /// Appends `rows` in schema column order. The header is written only when
    /// the log did not exist or was empty. An empty batch touches nothing.
    pub fn append(&self, rows: &[LogEntry]) -> Result<usize> {
        self.append_with(rows, |from, to| fs::rename(from, to))
    }

    fn append_with(&self, rows: &[LogEntry], rename: RenameFn) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut body = self.read_existing()?;
        let header = read_header(&body, &self.log_path)?;
        let write_header = match header {
            None => {
                body.clear();
                true
            }
            Some(found) if found.iter().eq(LOG_COLUMNS.iter()) => false,
            Some(found) => {
                return Err(LogError::SchemaDrift {
                    path: self.log_path.clone(),
                    version: LOG_SCHEMA_VERSION,
                    found,
                })
            }
        };

        if !body.is_empty() && !body.ends_with(b"\n") {
            body.push(b'\n');
        }
        body.extend(encode_rows(rows, write_header, &self.log_path)?);
        write_atomically_with(&self.log_path, &body, rename)?;
        debug!(path = %self.log_path.display(), rows = rows.len(), write_header, "appended to change log");
        Ok(rows.len())
    }

    /// Regenerates the deleted-only view from `log`. Returns its row count.
    pub fn deleted_view(&self, log: &ChangeLog) -> Result<usize> {
        let rows: Vec<LogEntry> = log.tombstones().cloned().collect();
        let body = encode_rows(&rows, true, &self.deleted_view_path)?;
        write_atomically(&self.deleted_view_path, &body)?;
        Ok(rows.len())
    }

    /// Writes `rows` with a header to an arbitrary path, replacing it atomically.
    pub fn write_table(&self, path: &Path, rows: &[LogEntry]) -> Result<usize> {
        let body = encode_rows(rows, true, path)?;
        write_atomically(path, &body)?;
        Ok(rows.len())
    }

    /// Rewrites a log whose header drifted from the current schema, keeping a
    /// `.bak` copy of the original. Refuses to discard non-empty values in
    /// unknown columns unless `allow_drop` is set.
    pub fn migrate(&self, allow_drop: bool) -> Result<MigrationReport> {
        let bytes = self.read_existing()?;
        let Some(header) = read_header(&bytes, &self.log_path)? else {
            return Ok(MigrationReport::NotNeeded);
        };
        if header.iter().eq(LOG_COLUMNS.iter()) {
            return Ok(MigrationReport::NotNeeded);
        }

        let unknown: Vec<(usize, &String)> = header
            .iter()
            .enumerate()
            .filter(|(_, column)| !LOG_COLUMNS.contains(&column.as_str()))
            .collect();
        let mut dropped_columns = Vec::new();
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(bytes.as_slice());
        for record in reader.records() {
            let record = record.map_err(csv_error(&self.log_path))?;
            for (index, column) in &unknown {
                let non_empty = record.get(*index).is_some_and(|value| !value.is_empty());
                if non_empty && !dropped_columns.contains(*column) {
                    dropped_columns.push((*column).clone());
                }
            }
        }
        if !dropped_columns.is_empty() && !allow_drop {
            return Err(LogError::MigrationWouldDrop {
                columns: dropped_columns,
            });
        }

        let null_filled_columns = LOG_COLUMNS
            .iter()
            .filter(|column| !header.iter().any(|found| found == *column))
            .map(|column| column.to_string())
            .collect();

        let log = parse_log(&bytes, &self.log_path)?;
        let backup_path = with_suffix(&self.log_path, ".bak");
        write_atomically(&backup_path, &bytes)?;
        let body = encode_rows(&log.entries, true, &self.log_path)?;
        write_atomically(&self.log_path, &body)?;

        Ok(MigrationReport::Migrated {
            rows: log.entries.len(),
            backup_path,
            null_filled_columns,
            dropped_columns,
        })
    }

    fn read_existing(&self) -> Result<Vec<u8>> {
        match fs::read(&self.log_path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(LogError::Io {
                path: self.log_path.clone(),
                source,
            }),
        }
    }
}

fn read_header(bytes: &[u8], path: &Path) -> Result<Option<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new().from_reader(bytes);
    let header = reader.headers().map_err(csv_error(path))?;
    if header.is_empty() {
        return Ok(None);
    }
    Ok(Some(header.iter().map(str::to_string).collect()))
}

fn parse_log(bytes: &[u8], path: &Path) -> Result<ChangeLog> {
    let Some(header) = read_header(bytes, path)? else {
        return Ok(ChangeLog::default());
    };
    if !header.iter().eq(LOG_COLUMNS.iter()) {
        warn!(path = %path.display(), found = ?header, "change log header differs from schema; matching columns by name");
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let mut entries = Vec::new();
    for row in reader.deserialize::<LogEntry>() {
        let mut entry = row.map_err(csv_error(path))?;
        if entry.composite_key.is_empty() {
            entry.composite_key = entry.compute_identity();
        }
        entries.push(entry);
    }
    Ok(ChangeLog {
        entries,
        header: Some(header),
    })
}

fn encode_rows(rows: &[LogEntry], with_header: bool, path: &Path) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    if with_header {
        writer.write_record(LOG_COLUMNS).map_err(csv_error(path))?;
    }
    for row in rows {
        writer.serialize(row).map_err(csv_error(path))?;
    }
    writer
        .into_inner()
        .map_err(|err| io_error(path)(err.into_error()))
}

/// Writes `body` to a temp file beside `target`, syncs it, then renames it into place.
type RenameFn = fn(&Path, &Path) -> io::Result<()>;

fn write_atomically(target: &Path, body: &[u8]) -> Result<()> {
    write_atomically_with(target, body, |from, to| fs::rename(from, to))
}

fn write_atomically_with(target: &Path, body: &[u8], rename: RenameFn) -> Result<()> {
    let parent = ensure_parent(target)?;
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "consultrack".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = (|| {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        file.write_all(body)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        rename(&temp_path, target)
    })();

    if let Err(source) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(LogError::Io {
            path: target.to_path_buf(),
            source,
        });
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<PathBuf> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(io_error(&parent))?;
    Ok(parent)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use consultrack_core::TOMBSTONE_STATUS;
    use tempfile::tempdir;

    const AT: &str = "2026-02-24T12:00:00.000000Z";

    fn entry(org: &str, reg: &str, status: &str) -> LogEntry {
        let mut entry = LogEntry {
            owner_org: Some(org.into()),
            registration_number: Some(reg.into()),
            status: Some(status.into()),
            title_en: Some(format!("Consultation {reg}")),
            ..Default::default()
        };
        entry.seal(AT);
        entry
    }

    fn store(dir: &Path) -> LogStore {
        LogStore::new(dir.join("log.csv"), dir.join("deleted.csv"))
    }

    fn header_lines(path: &Path) -> usize {
        let text = fs::read_to_string(path).expect("read log");
        text.lines()
            .filter(|line| line.starts_with("composite_key,"))
            .count()
    }

    #[test]
    fn missing_log_loads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let log = store(dir.path()).load().expect("load");
        assert!(log.is_empty());
        assert!(log.header.is_none());
        assert!(log.header_is_current());
    }

    #[test]
    fn zero_byte_log_loads_as_empty_and_gets_a_header_on_append() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        fs::write(store.log_path(), b"").expect("touch");
        assert!(store.load().expect("load").is_empty());

        store.append(&[entry("tc", "1", "O")]).expect("append");
        assert_eq!(header_lines(store.log_path()), 1);
    }

    #[test]
    fn header_is_written_once_across_appends() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        store.append(&[entry("tc", "1", "O")]).expect("first");
        store
            .append(&[entry("tc", "2", "O"), entry("tc", "3", "P")])
            .expect("second");

        assert_eq!(header_lines(store.log_path()), 1);
        let log = store.load().expect("load");
        assert_eq!(log.len(), 3);
        assert_eq!(log.entries[0], entry("tc", "1", "O"));
        assert!(log.header_is_current());
    }

    #[test]
    fn empty_batch_does_not_create_the_log() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        assert_eq!(store.append(&[]).expect("append"), 0);
        assert!(!store.log_path().exists());
    }

    #[test]
    fn append_preserves_existing_bytes() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        store.append(&[entry("tc", "1", "O")]).expect("first");
        let before = fs::read(store.log_path()).expect("read");
        store.append(&[entry("tc", "2", "O")]).expect("second");
        let after = fs::read(store.log_path()).expect("read");
        assert!(after.starts_with(&before));
        assert!(after.len() > before.len());
    }

    #[test]
    fn append_repairs_missing_trailing_newline() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        store.append(&[entry("tc", "1", "O")]).expect("first");
        let mut bytes = fs::read(store.log_path()).expect("read");
        bytes.pop();
        fs::write(store.log_path(), &bytes).expect("truncate newline");

        store.append(&[entry("tc", "2", "O")]).expect("second");
        assert_eq!(store.load().expect("load").len(), 2);
    }

    #[test]
    fn drifted_header_blocks_append_without_writing() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        let legacy = "registration_number,owner_org,status,hash,datetime\n7,tc,O,abc,2024-01-01\n";
        fs::write(store.log_path(), legacy).expect("seed");

        let err = store.append(&[entry("tc", "1", "O")]).unwrap_err();
        assert!(matches!(err, LogError::SchemaDrift { .. }));
        assert_eq!(fs::read_to_string(store.log_path()).expect("read"), legacy);
    }

    #[test]
    fn drifted_log_still_loads_by_column_name() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        fs::write(
            store.log_path(),
            "registration_number,owner_org,status,hash,datetime\n7,tc,O,abc,2024-01-01\n",
        )
        .expect("seed");

        let log = store.load().expect("load");
        assert!(!log.header_is_current());
        let row = &log.entries[0];
        assert_eq!(row.identity(), "tc-7");
        assert_eq!(row.status.as_deref(), Some("O"));
        assert_eq!(row.hash, "abc");
        assert_eq!(row.title_en, None);
    }

    #[test]
    fn migrate_rewrites_header_and_keeps_backup() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        let legacy = "registration_number,owner_org,status,hash\n7,tc,O,abc\n";
        fs::write(store.log_path(), legacy).expect("seed");

        let report = store.migrate(false).expect("migrate");
        let MigrationReport::Migrated {
            rows,
            backup_path,
            null_filled_columns,
            dropped_columns,
        } = report
        else {
            panic!("expected a migration");
        };
        assert_eq!(rows, 1);
        assert!(dropped_columns.is_empty());
        assert!(null_filled_columns.contains(&"title_en".to_string()));
        assert_eq!(fs::read_to_string(backup_path).expect("backup"), legacy);

        let log = store.load().expect("load");
        assert!(log.header_is_current());
        assert_eq!(log.entries[0].identity(), "tc-7");
        assert_eq!(store.migrate(false).expect("again"), MigrationReport::NotNeeded);
    }

    #[test]
    fn migrate_refuses_to_drop_populated_columns() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        fs::write(
            store.log_path(),
            "registration_number,owner_org,datetime\n7,tc,2024-01-01\n",
        )
        .expect("seed");

        let err = store.migrate(false).unwrap_err();
        assert!(matches!(err, LogError::MigrationWouldDrop { ref columns } if columns == &["datetime"]));
        assert!(matches!(
            store.migrate(true).expect("forced"),
            MigrationReport::Migrated { .. }
        ));
    }

    #[test]
    fn deleted_view_contains_only_tombstones() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        store
            .append(&[
                entry("tc", "1", "O"),
                entry("tc", "2", TOMBSTONE_STATUS),
                entry("tc", "3", "C"),
            ])
            .expect("append");
        let log = store.load().expect("load");

        assert_eq!(store.deleted_view(&log).expect("view"), 1);
        let view = LogStore::new(store.deleted_view_path(), dir.path().join("unused.csv"))
            .load()
            .expect("load view");
        assert_eq!(view.len(), 1);
        assert_eq!(view.entries[0].identity(), "tc-2");
        assert!(view.header_is_current());
    }

    #[test]
    fn deleted_view_is_written_with_header_even_when_empty() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        assert_eq!(store.deleted_view(&ChangeLog::default()).expect("view"), 0);
        assert_eq!(header_lines(store.deleted_view_path()), 1);
    }

    #[test]
    fn live_view_keeps_latest_non_deleted_state() {
        let mut revised = entry("tc", "1", "C");
        revised.row_chng_datetime = "later".into();
        let log = ChangeLog {
            entries: vec![
                entry("tc", "1", "O"),
                entry("tc", "2", "O"),
                revised.clone(),
                entry("tc", "2", TOMBSTONE_STATUS),
            ],
            header: None,
        };
        assert_eq!(log.live_view(), vec![revised]);
        assert_eq!(log.history("tc-2").len(), 2);
        assert!(log.history("tc-2")[0].is_tombstone());
    }

    #[test]
    fn second_lock_is_refused_until_first_is_dropped() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        let held = store.lock().expect("first lock");
        assert!(held.path().exists());
        assert!(matches!(store.lock(), Err(LogError::Locked(_))));
        drop(held);
        assert!(!store.lock_path().exists());
        store.lock().expect("relock");
    }

    fn temp_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .expect("read dir")
            .map(|entry| entry.expect("dir entry").file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect()
    }

    #[test]
    fn failed_append_leaves_log_untouched_and_no_temp_file() {
        let dir = tempdir().expect("tempdir");
        let store = store(dir.path());
        store.append(&[entry("tc", "1", "O")]).expect("seed");
        let before = fs::read(store.log_path()).expect("read log");

        let err = store
            .append_with(&[entry("tc", "2", "O")], |_, _| {
                Err(io::Error::other("no space left on device"))
            })
            .unwrap_err();

        assert!(matches!(err, LogError::Io { ref path, .. } if path == store.log_path()));
        assert_eq!(fs::read(store.log_path()).expect("read log"), before);
        assert!(temp_files(dir.path()).is_empty());
        assert_eq!(store.load().expect("load").len(), 1);
    }

    #[test]
    fn rename_onto_a_directory_fails_cleanly() {
        let dir = tempdir().expect("tempdir");
        let blocked = dir.path().join("deleted.csv");
        fs::create_dir(&blocked).expect("mkdir");
        fs::write(blocked.join("keep"), b"keep").expect("write");

        let store = LogStore::new(dir.path().join("log.csv"), blocked.clone());
        let log = ChangeLog {
            entries: vec![entry("tc", "1", TOMBSTONE_STATUS)],
            header: None,
        };
        let err = store.deleted_view(&log).unwrap_err();

        assert!(matches!(err, LogError::Io { .. }));
        assert!(blocked.is_dir());
        assert_eq!(fs::read(blocked.join("keep")).expect("read"), b"keep");
        assert!(temp_files(dir.path()).is_empty());
    }
}
