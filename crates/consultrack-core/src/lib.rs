//! Core domain model for the consultations change log.
//!
//! Everything in this crate is a pure transformation: records come in as bags of
//! named fields, leave as [`LogEntry`] rows carrying their identity, fingerprint
//! and observation time. Persistence lives in `consultrack-storage`.

mod fingerprint;
mod normalize;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub use fingerprint::{fingerprint, FINGERPRINT_EXCLUDED, NULL_TOKEN};
pub use normalize::{normalize_snapshot, NormalizedSnapshot, RawRecord};

pub const CRATE_NAME: &str = "consultrack-core";

/// Bumped whenever [`LOG_COLUMNS`] changes shape.
pub const LOG_SCHEMA_VERSION: u32 = 1;

/// Status written on synthesized tombstones. Never a real upstream status.
pub const TOMBSTONE_STATUS: &str = "DELETED";

pub const IDENTITY_COLUMN: &str = "composite_key";
pub const FINGERPRINT_COLUMN: &str = "hash";
pub const TIMESTAMP_COLUMN: &str = "row_chng_datetime";

/// Fixed on-disk column order of the change log and the deleted view.
pub const LOG_COLUMNS: [&str; 20] = [
    IDENTITY_COLUMN,
    "registration_number",
    "partner_departments",
    "subjects",
    "title_en",
    "title_fr",
    "description_en",
    "description_fr",
    "start_date",
    "end_date",
    "status",
    "profile_page_en",
    "profile_page_fr",
    "report_available_online",
    "report_link_en",
    "report_link_fr",
    "owner_org",
    "owner_org_title",
    FINGERPRINT_COLUMN,
    TIMESTAMP_COLUMN,
];

/// Columns computed by this system rather than taken from upstream.
pub const DERIVED_COLUMNS: [&str; 3] = [IDENTITY_COLUMN, FINGERPRINT_COLUMN, TIMESTAMP_COLUMN];

/// Composite identity `owner_org-registration_number`. Null parts render as the null token.
pub fn identity(owner_org: Option<&str>, registration_number: Option<&str>) -> String {
    format!(
        "{}-{}",
        owner_org.unwrap_or(NULL_TOKEN),
        registration_number.unwrap_or(NULL_TOKEN)
    )
}

/// Textual change timestamp stored in `row_chng_datetime`.
pub fn change_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// One row of the change log: an observed consultation state plus its
/// identity, fingerprint and observation time.
///
/// Field order is the on-disk column order; it must match [`LOG_COLUMNS`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogEntry {
    pub composite_key: String,
    pub registration_number: Option<String>,
    pub partner_departments: Option<String>,
    pub subjects: Option<String>,
    pub title_en: Option<String>,
    pub title_fr: Option<String>,
    pub description_en: Option<String>,
    pub description_fr: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub status: Option<String>,
    pub profile_page_en: Option<String>,
    pub profile_page_fr: Option<String>,
    pub report_available_online: Option<String>,
    pub report_link_en: Option<String>,
    pub report_link_fr: Option<String>,
    pub owner_org: Option<String>,
    pub owner_org_title: Option<String>,
    pub hash: String,
    pub row_chng_datetime: String,
}

impl LogEntry {
    pub fn identity(&self) -> &str {
        &self.composite_key
    }

    pub fn compute_identity(&self) -> String {
        identity(self.owner_org.as_deref(), self.registration_number.as_deref())
    }

    pub fn is_tombstone(&self) -> bool {
        self.status.as_deref() == Some(TOMBSTONE_STATUS)
    }

    /// All columns in [`LOG_COLUMNS`] order.
    pub fn columns(&self) -> [(&'static str, Option<&str>); 20] {
        [
            (IDENTITY_COLUMN, Some(self.composite_key.as_str())),
            ("registration_number", self.registration_number.as_deref()),
            ("partner_departments", self.partner_departments.as_deref()),
            ("subjects", self.subjects.as_deref()),
            ("title_en", self.title_en.as_deref()),
            ("title_fr", self.title_fr.as_deref()),
            ("description_en", self.description_en.as_deref()),
            ("description_fr", self.description_fr.as_deref()),
            ("start_date", self.start_date.as_deref()),
            ("end_date", self.end_date.as_deref()),
            ("status", self.status.as_deref()),
            ("profile_page_en", self.profile_page_en.as_deref()),
            ("profile_page_fr", self.profile_page_fr.as_deref()),
            ("report_available_online", self.report_available_online.as_deref()),
            ("report_link_en", self.report_link_en.as_deref()),
            ("report_link_fr", self.report_link_fr.as_deref()),
            ("owner_org", self.owner_org.as_deref()),
            ("owner_org_title", self.owner_org_title.as_deref()),
            (FINGERPRINT_COLUMN, Some(self.hash.as_str())),
            (TIMESTAMP_COLUMN, Some(self.row_chng_datetime.as_str())),
        ]
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns()
            .into_iter()
            .find(|(name, _)| *name == column)
            .and_then(|(_, value)| value)
    }

    /// Sets a content column by name. Returns `false` for derived or unknown columns.
    pub fn set_content(&mut self, column: &str, value: Option<String>) -> bool {
        let slot = match column {
            "registration_number" => &mut self.registration_number,
            "partner_departments" => &mut self.partner_departments,
            "subjects" => &mut self.subjects,
            "title_en" => &mut self.title_en,
            "title_fr" => &mut self.title_fr,
            "description_en" => &mut self.description_en,
            "description_fr" => &mut self.description_fr,
            "start_date" => &mut self.start_date,
            "end_date" => &mut self.end_date,
            "status" => &mut self.status,
            "profile_page_en" => &mut self.profile_page_en,
            "profile_page_fr" => &mut self.profile_page_fr,
            "report_available_online" => &mut self.report_available_online,
            "report_link_en" => &mut self.report_link_en,
            "report_link_fr" => &mut self.report_link_fr,
            "owner_org" => &mut self.owner_org,
            "owner_org_title" => &mut self.owner_org_title,
            _ => return false,
        };
        *slot = value;
        true
    }

    /// Fingerprint over every column except [`FINGERPRINT_EXCLUDED`].
    pub fn content_fingerprint(&self) -> String {
        fingerprint(self.columns(), &FINGERPRINT_EXCLUDED)
    }

    /// Recomputes the derived columns: identity first (it is hashed), then the
    /// fingerprint, then stamps the observation time.
    pub fn seal(&mut self, observed_at: &str) {
        self.composite_key = self.compute_identity();
        self.restamp(observed_at);
    }

    /// Recomputes fingerprint and observation time, keeping the stored identity.
    pub fn restamp(&mut self, observed_at: &str) {
        self.hash = self.content_fingerprint();
        self.row_chng_datetime = observed_at.to_string();
    }
}
