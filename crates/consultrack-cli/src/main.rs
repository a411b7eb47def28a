use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use consultrack_core::LogEntry;
use consultrack_storage::MigrationReport;
use consultrack_sync::{SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "consultrack")]
#[command(about = "Append-only change log for the consultations dataset")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the snapshot once and append changes and tombstones.
    Sync {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
    /// Rewrite a log with an outdated header into the current column order.
    Migrate {
        /// Discard populated columns that the current schema no longer has.
        #[arg(long)]
        allow_drop: bool,
    },
    /// Show every log entry for one identity, newest first.
    History {
        /// Composite identity, e.g. `hc-sc-1234`.
        identity: String,
    },
    /// Regenerate the deleted-only view from the log.
    Deleted,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::load()?;
    let pipeline = SyncPipeline::new(config)?;

    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            let summary = pipeline.run_once().await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serializing run summary")?
                );
            } else {
                print_summary(&summary);
            }
        }
        Commands::Schedule => {
            consultrack_sync::run_scheduled(Arc::new(pipeline)).await?;
        }
        Commands::Migrate { allow_drop } => {
            match pipeline.store().migrate(allow_drop)? {
                MigrationReport::NotNeeded => println!("log header already current; nothing to do"),
                MigrationReport::Migrated {
                    rows,
                    backup_path,
                    null_filled_columns,
                    dropped_columns,
                } => {
                    println!(
                        "migrated {rows} rows; backup at {}",
                        backup_path.display()
                    );
                    if !null_filled_columns.is_empty() {
                        println!("null-filled: {}", null_filled_columns.join(", "));
                    }
                    if !dropped_columns.is_empty() {
                        println!("dropped: {}", dropped_columns.join(", "));
                    }
                }
            }
        }
        Commands::History { identity } => {
            let log = pipeline.store().load()?;
            let entries = log.history(&identity);
            if entries.is_empty() {
                println!("no log entries for {identity}");
            }
            for entry in entries {
                print_entry(entry);
            }
        }
        Commands::Deleted => {
            let rows = pipeline.regenerate_deleted_view()?;
            println!(
                "deleted view: {rows} rows -> {}",
                pipeline.store().deleted_view_path().display()
            );
        }
    }

    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} mode={:?} snapshot={} appended={} (new={} changed={} resurrected={}) tombstoned={} deleted_view={} log_rows={}",
        summary.run_id,
        summary.mode,
        summary.snapshot_rows,
        summary.appended,
        summary.new_identities,
        summary.changed_identities,
        summary.resurrected_identities,
        summary.tombstoned,
        summary.deleted_view_rows,
        summary.log_rows,
    );
}

fn print_entry(entry: &LogEntry) {
    println!(
        "{}  status={:<8} end={:<10} hash={}  {}",
        entry.row_chng_datetime,
        entry.status.as_deref().unwrap_or("-"),
        entry.end_date.as_deref().unwrap_or("-"),
        entry.hash.chars().take(12).collect::<String>(),
        entry.title_en.as_deref().unwrap_or(""),
    );
}
