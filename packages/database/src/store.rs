//! Storage traits used by the pagination driver, the file worker, and the
//! invocation surfaces.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use riksdata_database_models::{
    ApiLogEntry, FetchProgress, FileDownloadTask, NewFileDownloadTask, Principal, ProgressUpdate,
    QueueStats, Role, TaskStatus,
};
use riksdata_source_models::{DataSource, MappedRecord};

use crate::DbError;

/// Idempotent writes of mapped records into their destination tables.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Inserts the record or overwrites the existing row with the same
    /// natural key. Returns the row's internal id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] on constraint violations other than the natural
    /// key conflict, or if the database is unreachable.
    async fn upsert_record(&self, record: &MappedRecord) -> Result<i64, DbError>;

    /// Writes a single text column on a row identified by internal id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the table or column is invalid or the write
    /// fails.
    async fn set_column(
        &self,
        table: &str,
        record_id: i64,
        column: &str,
        value: &str,
    ) -> Result<(), DbError>;
}

/// Progress rows and stop flags, keyed by (source, data type).
#[async_trait]
pub trait ProgressLedger: Send + Sync {
    /// Point read of one progress row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    async fn get_progress(
        &self,
        source: DataSource,
        data_type: &str,
    ) -> Result<Option<FetchProgress>, DbError>;

    /// Creates the row if needed and applies a partial update.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn update_progress(
        &self,
        source: DataSource,
        data_type: &str,
        update: &ProgressUpdate,
    ) -> Result<(), DbError>;

    /// Lists progress rows, optionally for one source.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    async fn list_progress(&self, source: Option<DataSource>)
    -> Result<Vec<FetchProgress>, DbError>;

    /// Uncached point read of the stop flag.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    async fn should_stop(&self, source: DataSource, data_type: &str) -> Result<bool, DbError>;

    /// Sets or clears the stop flag.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn set_stop_flag(
        &self,
        source: DataSource,
        data_type: &str,
        should_stop: bool,
    ) -> Result<(), DbError>;

    /// Sets status pending, zeroes counters, and clears the cursor, the
    /// run lease, and the stop flag in one atomic operation.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn reset_progress(&self, source: DataSource, data_type: &str) -> Result<(), DbError>;

    /// Deletes the progress and control rows. Returns `true` if a progress
    /// row existed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn delete_progress(&self, source: DataSource, data_type: &str) -> Result<bool, DbError>;

    /// Takes or renews the run lease. Succeeds when no lease is held, the
    /// held lease has expired, or `token` already holds it.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn claim_run(
        &self,
        source: DataSource,
        data_type: &str,
        token: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, DbError>;

    /// Drops the run lease if `token` holds it.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn release_run(
        &self,
        source: DataSource,
        data_type: &str,
        token: &str,
    ) -> Result<(), DbError>;
}

/// The attachment download queue.
#[async_trait]
pub trait FileQueue: Send + Sync {
    /// Inserts a pending task. Returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn enqueue(&self, task: &NewFileDownloadTask) -> Result<i64, DbError>;

    /// Moves up to `limit` tasks to processing and returns them, oldest
    /// first. Claims pending tasks, plus processing tasks whose
    /// `started_at` is at or before `stale_before` (their worker went away
    /// mid-batch). Concurrent callers never receive the same task.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn claim_pending(
        &self,
        limit: u32,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<FileDownloadTask>, DbError>;

    /// Marks a task completed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn mark_completed(&self, id: i64) -> Result<(), DbError>;

    /// Records a failed attempt. The task returns to pending, or becomes
    /// failed once its attempts reach `max_attempts`. Returns the new
    /// status.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn record_failure(&self, id: i64, error: &str) -> Result<TaskStatus, DbError>;

    /// Returns every failed task to pending with attempts zeroed. Returns
    /// the number of tasks reset.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn reset_failed(&self) -> Result<u64, DbError>;

    /// Task counts per status.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    async fn queue_stats(&self) -> Result<QueueStats, DbError>;
}

/// Append-only invocation audit log.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Appends one entry.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn append_log(&self, entry: &ApiLogEntry) -> Result<(), DbError>;
}

/// Bearer token to principal resolution.
#[async_trait]
pub trait AccessDirectory: Send + Sync {
    /// Resolves a raw bearer token. Returns `None` for unknown tokens.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the read fails.
    async fn principal_for_token(&self, token: &str) -> Result<Option<Principal>, DbError>;

    /// Registers a token for a user and grants the given roles.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    async fn register_token(&self, token: &str, user_id: &str, roles: &[Role])
    -> Result<(), DbError>;
}

/// Every storage concern the ingestion core needs.
pub trait IngestStore: RecordSink + ProgressLedger + FileQueue + AuditLog + AccessDirectory {}

impl<T> IngestStore for T where T: RecordSink + ProgressLedger + FileQueue + AuditLog + AccessDirectory
{}
