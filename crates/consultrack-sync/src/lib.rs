//! Change-log maintenance runs: fetch snapshot, diff against the log, append,
//! tombstone, regenerate the deleted view.

pub mod diff;
pub mod tombstone;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use consultrack_core::{change_timestamp, normalize_snapshot};
use consultrack_storage::{
    fetch_snapshot, HttpClientConfig, HttpFetcher, LogStore, SnapshotSource,
};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use diff::{diff_snapshot, vanished_identities, DiffOutcome, LogIndex};
pub use tombstone::synthesize_tombstones;

pub const CRATE_NAME: &str = "consultrack-sync";

pub const DEFAULT_SOURCE: &str =
    "https://open.canada.ca/data/en/datastore/dump/92bec4b7-6feb-4215-a5f7-61da342b2354";
pub const DEFAULT_CONFIG_FILE: &str = "consultrack.yaml";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub source: String,
    pub log_path: PathBuf,
    pub deleted_view_path: PathBuf,
    /// Where to cache the normalized snapshot for reporting; unset disables it.
    pub snapshot_path: Option<PathBuf>,
    /// On fetch failure, serve the log's live view instead of failing the run.
    pub fallback_to_log: bool,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            log_path: PathBuf::from("consultations_chng_log.csv"),
            deleted_view_path: PathBuf::from("consultations_deleted.csv"),
            snapshot_path: None,
            fallback_to_log: false,
            scheduler_enabled: false,
            sync_cron_1: "0 0 6 * * *".to_string(),
            sync_cron_2: "0 0 18 * * *".to_string(),
            user_agent: "consultrack/0.1".to_string(),
            http_timeout_secs: 60,
        }
    }
}

/// Optional YAML file layered between defaults and the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub source: Option<String>,
    pub log_path: Option<PathBuf>,
    pub deleted_view_path: Option<PathBuf>,
    pub snapshot_path: Option<PathBuf>,
    pub fallback_to_log: Option<bool>,
    pub scheduler_enabled: Option<bool>,
    pub sync_cron_1: Option<String>,
    pub sync_cron_2: Option<String>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
}

impl SyncConfig {
    /// Defaults, then `CONSULTRACK_CONFIG` (or `./consultrack.yaml` when
    /// present), then environment variables.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();
        let explicit = std::env::var("CONSULTRACK_CONFIG").ok().map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        if explicit.is_some() || path.exists() {
            config.apply_file(ConfigFile::from_path(&path)?);
        }
        config.apply_env();
        Ok(config)
    }

    pub fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.source {
            self.source = v;
        }
        if let Some(v) = file.log_path {
            self.log_path = v;
        }
        if let Some(v) = file.deleted_view_path {
            self.deleted_view_path = v;
        }
        if file.snapshot_path.is_some() {
            self.snapshot_path = file.snapshot_path;
        }
        if let Some(v) = file.fallback_to_log {
            self.fallback_to_log = v;
        }
        if let Some(v) = file.scheduler_enabled {
            self.scheduler_enabled = v;
        }
        if let Some(v) = file.sync_cron_1 {
            self.sync_cron_1 = v;
        }
        if let Some(v) = file.sync_cron_2 {
            self.sync_cron_2 = v;
        }
        if let Some(v) = file.user_agent {
            self.user_agent = v;
        }
        if let Some(v) = file.http_timeout_secs {
            self.http_timeout_secs = v;
        }
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CONSULTRACK_SOURCE") {
            self.source = v;
        }
        if let Ok(v) = std::env::var("CONSULTRACK_LOG_PATH") {
            self.log_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CONSULTRACK_DELETED_PATH") {
            self.deleted_view_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CONSULTRACK_SNAPSHOT_PATH") {
            self.snapshot_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_flag("CONSULTRACK_FALLBACK_TO_LOG") {
            self.fallback_to_log = v;
        }
        if let Some(v) = env_flag("CONSULTRACK_SCHEDULER_ENABLED") {
            self.scheduler_enabled = v;
        }
        if let Ok(v) = std::env::var("SYNC_CRON_1") {
            self.sync_cron_1 = v;
        }
        if let Ok(v) = std::env::var("SYNC_CRON_2") {
            self.sync_cron_2 = v;
        }
        if let Ok(v) = std::env::var("CONSULTRACK_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = std::env::var("CONSULTRACK_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.http_timeout_secs = v;
        }
    }
}

impl ConfigFile {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    /// Snapshot fetched; change detection ran.
    Fetched,
    /// Snapshot unavailable; live view reused for reporting only.
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: SnapshotMode,
    pub snapshot_rows: usize,
    pub appended: usize,
    pub new_identities: usize,
    pub changed_identities: usize,
    pub resurrected_identities: usize,
    pub collapsed_duplicates: usize,
    pub tombstoned: usize,
    pub deleted_view_rows: usize,
    pub log_rows: usize,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: LogStore,
    http: HttpFetcher,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let store = LogStore::new(config.log_path.clone(), config.deleted_view_path.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            store,
            http,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let _lock = self.store.lock().context("acquiring change log lock")?;

        let source = SnapshotSource::parse(&self.config.source);
        let raw = match fetch_snapshot(&self.http, run_id, &source).await {
            Ok(raw) => raw,
            Err(err) if self.config.fallback_to_log => {
                warn!(%source, error = %err, "snapshot unavailable; falling back to change log for reporting");
                return self.run_fallback(run_id, started_at);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("snapshot unavailable from {source}"))
            }
        };

        let observed_at = change_timestamp(started_at);
        let snapshot = normalize_snapshot(&raw, &observed_at);
        if !snapshot.missing_columns.is_empty() {
            warn!(columns = ?snapshot.missing_columns, "snapshot is missing expected columns; null-filling");
        }
        if !snapshot.unknown_columns.is_empty() {
            warn!(columns = ?snapshot.unknown_columns, "snapshot has columns outside the log schema; ignoring");
        }

        let mut log = self.store.load().context("loading change log")?;
        if !log.header_is_current() {
            bail!(
                "{} has a header from an older schema; run `consultrack migrate` first",
                self.store.log_path().display()
            );
        }

        let (diff, tombstones) = {
            let index = LogIndex::build(&log.entries);
            let diff = diff_snapshot(&index, &snapshot.entries);
            let vanished = vanished_identities(&index, &snapshot.entries);
            let tombstones = synthesize_tombstones(&index, &vanished, &observed_at);
            (diff, tombstones)
        };

        let appended = diff.appended.len();
        let tombstoned = tombstones.len();
        let mut batch = diff.appended;
        batch.extend(tombstones);
        self.store
            .append(&batch)
            .context("appending to change log")?;
        log.entries.extend(batch);

        let deleted_view_rows = self
            .store
            .deleted_view(&log)
            .context("writing deleted view")?;

        if let Some(path) = &self.config.snapshot_path {
            self.store
                .write_table(path, &snapshot.entries)
                .with_context(|| format!("writing snapshot cache {}", path.display()))?;
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            mode: SnapshotMode::Fetched,
            snapshot_rows: snapshot.entries.len(),
            appended,
            new_identities: diff.new_identities,
            changed_identities: diff.changed_identities,
            resurrected_identities: diff.resurrected_identities,
            collapsed_duplicates: diff.collapsed_duplicates,
            tombstoned,
            deleted_view_rows,
            log_rows: log.len(),
        };
        info!(
            appended = summary.appended,
            tombstoned = summary.tombstoned,
            deleted_view_rows = summary.deleted_view_rows,
            log_rows = summary.log_rows,
            "sync complete"
        );
        Ok(summary)
    }

    fn run_fallback(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<SyncRunSummary> {
        let log = self.store.load().context("loading change log")?;
        let deleted_view_rows = self
            .store
            .deleted_view(&log)
            .context("writing deleted view")?;

        let live = log.live_view();
        if let Some(path) = &self.config.snapshot_path {
            self.store
                .write_table(path, &live)
                .with_context(|| format!("writing snapshot cache {}", path.display()))?;
        }

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            mode: SnapshotMode::Fallback,
            snapshot_rows: live.len(),
            appended: 0,
            new_identities: 0,
            changed_identities: 0,
            resurrected_identities: 0,
            collapsed_duplicates: 0,
            tombstoned: 0,
            deleted_view_rows,
            log_rows: log.len(),
        })
    }

    /// Rewrites the deleted view from the log without fetching.
    pub fn regenerate_deleted_view(&self) -> Result<usize> {
        let _lock = self.store.lock().context("acquiring change log lock")?;
        let log = self.store.load().context("loading change log")?;
        self.store
            .deleted_view(&log)
            .context("writing deleted view")
    }
}

pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let crons = [
        pipeline.config().sync_cron_1.clone(),
        pipeline.config().sync_cron_2.clone(),
    ];
    for cron in crons {
        let pipeline = Arc::clone(&pipeline);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, appended = summary.appended, "scheduled sync finished"),
                    Err(err) => error!(error = ?err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

/// Runs scheduled syncs until Ctrl-C.
pub async fn run_scheduled(pipeline: Arc<SyncPipeline>) -> Result<()> {
    let Some(mut sched) = maybe_build_scheduler(pipeline).await? else {
        bail!("scheduler is disabled; set CONSULTRACK_SCHEDULER_ENABLED=1");
    };
    sched.start().await.context("starting scheduler")?;
    info!("scheduler started");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
