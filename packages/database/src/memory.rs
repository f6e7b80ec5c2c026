//! In-process implementation of every storage trait.
//!
//! Backs unit tests across the workspace and `--dry-run` CLI invocations.
//! Behaves like the Postgres store where the ingestion core can observe a
//! difference: upserts keep one row per natural key and return a stable
//! id, `NOT NULL` columns can be declared per table, and the stop flag is
//! read fresh every time.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use riksdata_database_models::{
    ApiLogEntry, FetchProgress, FileDownloadTask, NewFileDownloadTask, Principal,
    ProgressUpdate, QueueStats, Role, TaskStatus,
};
use riksdata_source_models::{DataSource, FieldValue, MappedRecord};

use crate::store::{AccessDirectory, AuditLog, FileQueue, ProgressLedger, RecordSink};
use crate::{DbError, hash_token, validate_identifiers};

type LedgerKey = (DataSource, String);

/// One stored row of a destination table.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRow {
    /// Internal id.
    pub id: i64,
    /// Column values.
    pub fields: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    tables: BTreeMap<String, Vec<MemoryRow>>,
    required: BTreeMap<String, Vec<String>>,
    progress: BTreeMap<LedgerKey, FetchProgress>,
    control: BTreeMap<LedgerKey, bool>,
    queue: Vec<FileDownloadTask>,
    log: Vec<ApiLogEntry>,
    tokens: BTreeMap<String, String>,
    roles: BTreeMap<String, Vec<Role>>,
}

impl State {
    const fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a `NOT NULL` column on a destination table. Upserts that
    /// omit it fail with [`DbError::Constraint`].
    #[must_use]
    pub fn with_required_column(self, table: &str, column: &str) -> Self {
        self.lock()
            .required
            .entry(table.to_string())
            .or_default()
            .push(column.to_string());
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of a destination table.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<MemoryRow> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Finds a row by natural key.
    #[must_use]
    pub fn find_row(&self, table: &str, key_column: &str, key: &str) -> Option<MemoryRow> {
        self.lock().tables.get(table).and_then(|rows| {
            rows.iter()
                .find(|row| row.fields.get(key_column).and_then(FieldValue::as_text) == Some(key))
                .cloned()
        })
    }

    /// Snapshot of the file queue.
    #[must_use]
    pub fn tasks(&self) -> Vec<FileDownloadTask> {
        self.lock().queue.clone()
    }

    /// Snapshot of the audit log.
    #[must_use]
    pub fn log_entries(&self) -> Vec<ApiLogEntry> {
        self.lock().log.clone()
    }
}

#[async_trait]
impl RecordSink for MemoryStore {
    async fn upsert_record(&self, record: &MappedRecord) -> Result<i64, DbError> {
        validate_identifiers(&record.table, record.fields.keys().map(String::as_str))?;

        let mut state = self.lock();

        if let Some(required) = state.required.get(&record.table) {
            for column in required {
                if record.field(column).is_none_or(FieldValue::is_null) {
                    return Err(DbError::Constraint {
                        table: record.table.clone(),
                        message: format!("null value in column \"{column}\""),
                    });
                }
            }
        }

        let existing = state.tables.get(&record.table).and_then(|rows| {
            rows.iter().position(|row| {
                row.fields
                    .get(&record.conflict_key)
                    .and_then(FieldValue::as_text)
                    == Some(record.natural_key.as_str())
            })
        });

        if let Some(index) = existing {
            let rows = state.tables.entry(record.table.clone()).or_default();
            let row = &mut rows[index];
            for (column, value) in &record.fields {
                row.fields.insert(column.clone(), value.clone());
            }
            return Ok(row.id);
        }

        let id = state.next_id();
        state
            .tables
            .entry(record.table.clone())
            .or_default()
            .push(MemoryRow {
                id,
                fields: record.fields.clone(),
            });
        Ok(id)
    }

    async fn set_column(
        &self,
        table: &str,
        record_id: i64,
        column: &str,
        value: &str,
    ) -> Result<(), DbError> {
        validate_identifiers(table, [column])?;

        let mut state = self.lock();
        if let Some(row) = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|row| row.id == record_id))
        {
            row.fields
                .insert(column.to_string(), FieldValue::Text(value.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressLedger for MemoryStore {
    async fn get_progress(
        &self,
        source: DataSource,
        data_type: &str,
    ) -> Result<Option<FetchProgress>, DbError> {
        Ok(self
            .lock()
            .progress
            .get(&(source, data_type.to_string()))
            .cloned())
    }

    async fn update_progress(
        &self,
        source: DataSource,
        data_type: &str,
        update: &ProgressUpdate,
    ) -> Result<(), DbError> {
        self.lock()
            .progress
            .entry((source, data_type.to_string()))
            .or_insert_with(|| FetchProgress::new(source, data_type))
            .apply(update, Utc::now());
        Ok(())
    }

    async fn list_progress(
        &self,
        source: Option<DataSource>,
    ) -> Result<Vec<FetchProgress>, DbError> {
        Ok(self
            .lock()
            .progress
            .values()
            .filter(|p| source.is_none_or(|s| p.source == s))
            .cloned()
            .collect())
    }

    async fn should_stop(&self, source: DataSource, data_type: &str) -> Result<bool, DbError> {
        Ok(self
            .lock()
            .control
            .get(&(source, data_type.to_string()))
            .copied()
            .unwrap_or(false))
    }

    async fn set_stop_flag(
        &self,
        source: DataSource,
        data_type: &str,
        should_stop: bool,
    ) -> Result<(), DbError> {
        self.lock()
            .control
            .insert((source, data_type.to_string()), should_stop);
        Ok(())
    }

    async fn reset_progress(&self, source: DataSource, data_type: &str) -> Result<(), DbError> {
        let key = (source, data_type.to_string());
        let mut state = self.lock();
        let mut fresh = FetchProgress::new(source, data_type);
        fresh.last_fetched_at = Some(Utc::now());
        state.progress.insert(key.clone(), fresh);
        state.control.insert(key, false);
        Ok(())
    }

    async fn delete_progress(&self, source: DataSource, data_type: &str) -> Result<bool, DbError> {
        let key = (source, data_type.to_string());
        let mut state = self.lock();
        state.control.remove(&key);
        Ok(state.progress.remove(&key).is_some())
    }

    async fn claim_run(
        &self,
        source: DataSource,
        data_type: &str,
        token: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let mut state = self.lock();
        let progress = state
            .progress
            .entry((source, data_type.to_string()))
            .or_insert_with(|| FetchProgress::new(source, data_type));

        let free = match (&progress.run_token, progress.lease_expires_at) {
            (None, _) => true,
            (Some(held), _) if held == token => true,
            (Some(_), Some(expires)) => expires < now,
            (Some(_), None) => false,
        };

        if free {
            progress.run_token = Some(token.to_string());
            progress.lease_expires_at = Some(lease_until);
        }
        Ok(free)
    }

    async fn release_run(
        &self,
        source: DataSource,
        data_type: &str,
        token: &str,
    ) -> Result<(), DbError> {
        if let Some(progress) = self
            .lock()
            .progress
            .get_mut(&(source, data_type.to_string()))
            && progress.run_token.as_deref() == Some(token)
        {
            progress.run_token = None;
            progress.lease_expires_at = None;
        }
        Ok(())
    }
}

#[async_trait]
impl FileQueue for MemoryStore {
    async fn enqueue(&self, task: &NewFileDownloadTask) -> Result<i64, DbError> {
        let mut state = self.lock();
        let id = state.next_id();
        state.queue.push(FileDownloadTask {
            id,
            file_url: task.file_url.clone(),
            bucket: task.bucket.clone(),
            storage_path: task.storage_path.clone(),
            table_name: task.table_name.clone(),
            record_id: task.record_id,
            column_name: task.column_name.clone(),
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: task.max_attempts,
            error_message: None,
            created_at: Some(Utc::now()),
            started_at: None,
            completed_at: None,
        });
        Ok(id)
    }

    async fn claim_pending(
        &self,
        limit: u32,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<FileDownloadTask>, DbError> {
        let now = Utc::now();
        let mut state = self.lock();
        let claimed = state
            .queue
            .iter_mut()
            .filter(|task| match task.status {
                TaskStatus::Pending => true,
                TaskStatus::Processing => task.started_at.is_none_or(|at| at <= stale_before),
                TaskStatus::Completed | TaskStatus::Failed => false,
            })
            .take(limit as usize)
            .map(|task| {
                task.status = TaskStatus::Processing;
                task.started_at = Some(now);
                task.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn mark_completed(&self, id: i64) -> Result<(), DbError> {
        if let Some(task) = self.lock().queue.iter_mut().find(|t| t.id == id) {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.error_message = None;
        }
        Ok(())
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<TaskStatus, DbError> {
        let mut state = self.lock();
        let task = state
            .queue
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| DbError::Conversion {
                message: format!("No file download task with id {id}"),
            })?;

        task.attempts += 1;
        task.error_message = Some(error.to_string());
        task.status = if task.attempts >= task.max_attempts {
            TaskStatus::Failed
        } else {
            TaskStatus::Pending
        };
        Ok(task.status)
    }

    async fn reset_failed(&self) -> Result<u64, DbError> {
        let mut count = 0;
        for task in &mut self.lock().queue {
            if task.status == TaskStatus::Failed {
                task.status = TaskStatus::Pending;
                task.attempts = 0;
                task.error_message = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn queue_stats(&self) -> Result<QueueStats, DbError> {
        let mut stats = QueueStats::default();
        for task in &self.lock().queue {
            stats.add(task.status, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl AuditLog for MemoryStore {
    async fn append_log(&self, entry: &ApiLogEntry) -> Result<(), DbError> {
        self.lock().log.push(entry.clone());
        Ok(())
    }
}

#[async_trait]
impl AccessDirectory for MemoryStore {
    async fn principal_for_token(&self, token: &str) -> Result<Option<Principal>, DbError> {
        let state = self.lock();
        Ok(state.tokens.get(&hash_token(token)).map(|user_id| Principal {
            user_id: user_id.clone(),
            roles: state.roles.get(user_id).cloned().unwrap_or_default(),
        }))
    }

    async fn register_token(
        &self,
        token: &str,
        user_id: &str,
        roles: &[Role],
    ) -> Result<(), DbError> {
        let mut state = self.lock();
        state
            .tokens
            .insert(hash_token(token), user_id.to_string());
        let granted = state.roles.entry(user_id.to_string()).or_default();
        for role in roles {
            if !granted.contains(role) {
                granted.push(*role);
            }
        }
        Ok(())
    }
}
