//! Snapshot sources and CSV decoding into raw records.

use std::fmt;
use std::path::PathBuf;

use consultrack_core::RawRecord;
use tracing::info;
use uuid::Uuid;

use crate::fetch::{FetchError, HttpFetcher};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Where a run reads its snapshot from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotSource {
    Url(String),
    File(PathBuf),
}

impl SnapshotSource {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Self::Url(trimmed.to_string())
        } else {
            Self::File(PathBuf::from(trimmed))
        }
    }
}

impl fmt::Display for SnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Parses CSV bytes into records keyed by header. Short rows simply lack the
/// trailing columns; the normalizer null-fills them.
///
/// A header with no rows is a valid, empty snapshot. Input with no header at
/// all (a zero-byte or blank body) is rejected with
/// [`FetchError::MissingHeader`].
pub fn decode_snapshot(bytes: &[u8]) -> Result<Vec<RawRecord>, FetchError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(bytes);
    let headers = reader.headers()?.clone();
    if headers.iter().all(|column| column.trim().is_empty()) {
        return Err(FetchError::MissingHeader);
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let record: RawRecord = headers
            .iter()
            .zip(row.iter())
            .map(|(column, value)| (column.to_string(), value.to_string()))
            .collect();
        records.push(record);
    }
    Ok(records)
}

/// Reads and decodes the full snapshot. Any failure means the snapshot is
/// unavailable for this run.
pub async fn fetch_snapshot(
    fetcher: &HttpFetcher,
    run_id: Uuid,
    source: &SnapshotSource,
) -> Result<Vec<RawRecord>, FetchError> {
    let bytes = match source {
        SnapshotSource::Url(url) => fetcher.fetch_bytes(run_id, url).await?,
        SnapshotSource::File(path) => {
            tokio::fs::read(path)
                .await
                .map_err(|source| FetchError::Io {
                    path: path.clone(),
                    source,
                })?
        }
    };
    let records = decode_snapshot(&bytes)?;
    info!(%run_id, %source, bytes = bytes.len(), records = records.len(), "snapshot fetched");
    Ok(records)
}
