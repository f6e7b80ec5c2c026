#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Row types for the progress ledger, the control table, the file download
//! queue, the audit log, and the access directory.
//!
//! These are the shapes persisted by `riksdata_database` and reported by
//! the server and CLI. Mapped source records live in
//! `riksdata_source_models`.

use chrono::{DateTime, Utc};
use riksdata_source_models::DataSource;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Default attempt ceiling for a file download task.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Identifies one ingestion stream: a source and one of its data types.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceKey {
    /// Source system.
    pub source: DataSource,
    /// Normalized data type.
    pub data_type: String,
}

impl DataSourceKey {
    /// Creates a key.
    #[must_use]
    pub fn new(source: DataSource, data_type: impl Into<String>) -> Self {
        Self {
            source,
            data_type: data_type.into(),
        }
    }
}

impl std::fmt::Display for DataSourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.source, self.data_type)
    }
}

/// Lifecycle of a (source, data type) fetch run.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FetchStatus {
    /// Never run, or reset.
    #[default]
    Pending,
    /// A run is underway or stopped at its page budget with pages remaining.
    InProgress,
    /// The last run reached the end of the data.
    Completed,
    /// The last run gave up after exhausting retries.
    Failed,
    /// The last run observed the stop flag.
    Stopped,
}

/// Persisted progress of one (source, data type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchProgress {
    /// Source system.
    pub source: DataSource,
    /// Normalized data type.
    pub data_type: String,
    /// Current run status.
    pub status: FetchStatus,
    /// Last fully processed page.
    pub current_page: u64,
    /// Total pages reported by the source, if known.
    pub total_pages: Option<u64>,
    /// Items successfully upserted in the current run.
    pub items_fetched: u64,
    /// Total items reported by the source, if known.
    pub total_items: Option<u64>,
    /// Error from the last failed or stopped run.
    pub error_message: Option<String>,
    /// First page URL of the run the cursor belongs to. Encodes the
    /// run's filters; a request with different filters starts over.
    pub start_url: Option<String>,
    /// Cursor of the next page to fetch when resuming a partial run.
    pub next_page_url: Option<String>,
    /// Token of the invocation currently holding the run lease.
    pub run_token: Option<String>,
    /// When the run lease lapses.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Last time this row was written.
    pub last_fetched_at: Option<DateTime<Utc>>,
}

impl FetchProgress {
    /// A fresh row in [`FetchStatus::Pending`].
    #[must_use]
    pub fn new(source: DataSource, data_type: &str) -> Self {
        Self {
            source,
            data_type: data_type.to_string(),
            status: FetchStatus::Pending,
            current_page: 0,
            total_pages: None,
            items_fetched: 0,
            total_items: None,
            error_message: None,
            start_url: None,
            next_page_url: None,
            run_token: None,
            lease_expires_at: None,
            last_fetched_at: None,
        }
    }

    /// Applies a partial update in place.
    pub fn apply(&mut self, update: &ProgressUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(page) = update.current_page {
            self.current_page = page;
        }
        if let Some(total) = update.total_pages {
            self.total_pages = total;
        }
        if let Some(items) = update.items_fetched {
            self.items_fetched = items;
        }
        if let Some(total) = update.total_items {
            self.total_items = total;
        }
        if let Some(message) = &update.error_message {
            self.error_message.clone_from(message);
        }
        if let Some(url) = &update.start_url {
            self.start_url.clone_from(url);
        }
        if let Some(url) = &update.next_page_url {
            self.next_page_url.clone_from(url);
        }
        self.last_fetched_at = Some(now);
    }
}

/// Partial update of a [`FetchProgress`] row. Unset fields are left alone;
/// nullable fields use a nested `Option` so they can be cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// New status.
    pub status: Option<FetchStatus>,
    /// New current page.
    pub current_page: Option<u64>,
    /// New total page count.
    pub total_pages: Option<Option<u64>>,
    /// New items fetched count.
    pub items_fetched: Option<u64>,
    /// New total item count.
    pub total_items: Option<Option<u64>>,
    /// New error message.
    pub error_message: Option<Option<String>>,
    /// New run start URL.
    pub start_url: Option<Option<String>>,
    /// New resume cursor.
    pub next_page_url: Option<Option<String>>,
}

impl ProgressUpdate {
    /// Sets the status.
    #[must_use]
    pub const fn status(mut self, status: FetchStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the last processed page.
    #[must_use]
    pub const fn current_page(mut self, page: u64) -> Self {
        self.current_page = Some(page);
        self
    }

    /// Sets the source-reported totals.
    #[must_use]
    pub const fn totals(mut self, total_pages: Option<u64>, total_items: Option<u64>) -> Self {
        self.total_pages = Some(total_pages);
        self.total_items = Some(total_items);
        self
    }

    /// Sets the items fetched count.
    #[must_use]
    pub const fn items_fetched(mut self, items: u64) -> Self {
        self.items_fetched = Some(items);
        self
    }

    /// Sets or clears the error message.
    #[must_use]
    pub fn error_message(mut self, message: Option<String>) -> Self {
        self.error_message = Some(message);
        self
    }

    /// Sets or clears the URL the run started from.
    #[must_use]
    pub fn start_url(mut self, url: Option<String>) -> Self {
        self.start_url = Some(url);
        self
    }

    /// Sets or clears the resume cursor.
    #[must_use]
    pub fn next_page_url(mut self, url: Option<String>) -> Self {
        self.next_page_url = Some(url);
        self
    }
}

/// Lifecycle of a file download task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Stored and back-written.
    Completed,
    /// Reached its attempt ceiling; only an administrative reset revives it.
    Failed,
}

/// A queued attachment download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDownloadTask {
    /// Primary key.
    pub id: i64,
    /// Absolute source URL.
    pub file_url: String,
    /// Destination bucket.
    pub bucket: String,
    /// Sanitized destination path.
    pub storage_path: String,
    /// Table of the owning record.
    pub table_name: String,
    /// Internal row id of the owning record.
    pub record_id: i64,
    /// Column to back-fill with the stored file's public URL.
    pub column_name: String,
    /// Current state.
    pub status: TaskStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Attempt ceiling.
    pub max_attempts: u32,
    /// Error from the last failed attempt.
    pub error_message: Option<String>,
    /// When the task was enqueued.
    pub created_at: Option<DateTime<Utc>>,
    /// When the last attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task completed.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for enqueueing a [`FileDownloadTask`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFileDownloadTask {
    /// Absolute source URL.
    pub file_url: String,
    /// Destination bucket.
    pub bucket: String,
    /// Sanitized destination path.
    pub storage_path: String,
    /// Table of the owning record.
    pub table_name: String,
    /// Internal row id of the owning record.
    pub record_id: i64,
    /// Column to back-fill.
    pub column_name: String,
    /// Attempt ceiling.
    pub max_attempts: u32,
}

/// Task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks waiting for a worker.
    pub pending: u64,
    /// Tasks claimed by a worker.
    pub processing: u64,
    /// Tasks done.
    pub completed: u64,
    /// Tasks at their attempt ceiling.
    pub failed: u64,
}

impl QueueStats {
    /// Adds `count` tasks in `status`.
    pub const fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Processing => self.processing += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
        }
    }
}

/// Outcome recorded in the audit log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApiLogStatus {
    /// Ran to the end of the data.
    Success,
    /// Stopped at the page budget or page cap with pages remaining.
    Partial,
    /// Stopped by the stop flag.
    Stopped,
    /// Failed after exhausting retries.
    Failed,
}

/// One append-only audit record per invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLogEntry {
    /// Source system.
    pub source: DataSource,
    /// Data type invoked.
    pub endpoint: String,
    /// Outcome.
    pub status: ApiLogStatus,
    /// Records upserted.
    pub record_count: u64,
    /// Short error summary, if anything went wrong.
    pub error_summary: Option<String>,
}

/// Role granted to a user.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    /// May trigger ingestion and administrative operations.
    Admin,
    /// Authenticated, no ingestion rights.
    User,
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable user identifier.
    pub user_id: String,
    /// Roles granted to the user.
    pub roles: Vec<Role>,
}

impl Principal {
    /// Returns `true` if the principal holds `role`.
    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_stored_values() {
        assert_eq!(FetchStatus::InProgress.to_string(), "in_progress");
        assert_eq!(
            "stopped".parse::<FetchStatus>().unwrap(),
            FetchStatus::Stopped
        );
        assert_eq!(TaskStatus::Processing.as_ref(), "processing");
    }

    #[test]
    fn apply_leaves_unset_fields_alone() {
        let now = Utc::now();
        let mut progress = FetchProgress::new(DataSource::Riksdagen, "dokument");
        progress.apply(
            &ProgressUpdate::default()
                .totals(Some(4), Some(80))
                .error_message(Some("boom".to_string())),
            now,
        );
        progress.apply(
            &ProgressUpdate::default()
                .status(FetchStatus::InProgress)
                .current_page(1),
            now,
        );

        assert_eq!(progress.total_pages, Some(4));
        assert_eq!(progress.total_items, Some(80));
        assert_eq!(progress.error_message.as_deref(), Some("boom"));
        assert_eq!(progress.current_page, 1);
        assert_eq!(progress.status, FetchStatus::InProgress);
        assert_eq!(progress.last_fetched_at, Some(now));
    }

    #[test]
    fn apply_can_clear_nullable_fields() {
        let mut progress = FetchProgress::new(DataSource::Riksdagen, "dokument");
        progress.next_page_url = Some("https://data.riksdagen.se/p2".to_string());
        progress.apply(&ProgressUpdate::default().next_page_url(None), Utc::now());
        assert_eq!(progress.next_page_url, None);
    }

    #[test]
    fn progress_serializes_camel_case() {
        let json = serde_json::to_value(FetchProgress::new(DataSource::Riksdagen, "dokument"))
            .unwrap();
        assert_eq!(json["dataType"], "dokument");
        assert_eq!(json["currentPage"], 0);
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn queue_stats_accumulate_by_status() {
        let mut stats = QueueStats::default();
        stats.add(TaskStatus::Pending, 3);
        stats.add(TaskStatus::Failed, 1);
        stats.add(TaskStatus::Pending, 2);
        assert_eq!(stats.pending, 5);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn key_displays_as_log_prefix() {
        let key = DataSourceKey::new(DataSource::Regeringskansliet, "ud-avrader");
        assert_eq!(key.to_string(), "regeringskansliet/ud-avrader");
    }
}
