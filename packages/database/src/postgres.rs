//! Postgres implementation of the storage traits.
//!
//! All statements are raw SQL through `query_raw_params()` /
//! `exec_raw_params()`. Destination table and column names come from the
//! embedded source registry and are validated with
//! [`validate_identifiers`] before being interpolated; every value is a
//! bound parameter.

use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use moosicbox_json_utils::database::ToValue as _;
use riksdata_database_models::{
    ApiLogEntry, FetchProgress, FetchStatus, FileDownloadTask, NewFileDownloadTask, Principal,
    ProgressUpdate, QueueStats, Role, TaskStatus,
};
use riksdata_source_models::{DataSource, FieldValue, MappedRecord};
use switchy_database::{Database, DatabaseValue, Row};

use crate::store::{AccessDirectory, AuditLog, FileQueue, ProgressLedger, RecordSink};
use crate::{DbError, hash_token, validate_identifiers};

const PROGRESS_COLUMNS: &str = "source, data_type, status, current_page, total_pages, \
     items_fetched, total_items, error_message, start_url, next_page_url, run_token, \
     lease_expires_at, last_fetched_at";

const TASK_COLUMNS: &str = "id, file_url, bucket, storage_path, table_name, record_id, \
     column_name, status, attempts, max_attempts, error_message, created_at, started_at, \
     completed_at";

/// Storage backed by a `switchy_database` Postgres connection.
#[derive(Debug)]
pub struct PgStore {
    db: Box<dyn Database>,
}

impl PgStore {
    /// Wraps an open connection.
    #[must_use]
    pub fn new(db: Box<dyn Database>) -> Self {
        Self { db }
    }

    /// The underlying connection, for migrations.
    #[must_use]
    pub fn database(&self) -> &dyn Database {
        &*self.db
    }
}

/// Converts an `Option<&str>` to a [`DatabaseValue`], using `Null` for `None`.
fn opt_str(value: Option<&str>) -> DatabaseValue {
    value.map_or(DatabaseValue::Null, |s| DatabaseValue::String(s.to_string()))
}

/// Converts a count to a `BIGINT` parameter.
fn count_value(value: u64) -> DatabaseValue {
    DatabaseValue::Int64(i64::try_from(value).unwrap_or(i64::MAX))
}

fn opt_count(value: Option<u64>) -> DatabaseValue {
    value.map_or(DatabaseValue::Null, count_value)
}

fn timestamp(value: DateTime<Utc>) -> DatabaseValue {
    DatabaseValue::DateTime(value.naive_utc())
}

fn field_value(value: &FieldValue) -> DatabaseValue {
    match value {
        FieldValue::Text(s) => DatabaseValue::String(s.clone()),
        FieldValue::Integer(i) => DatabaseValue::Int64(*i),
        FieldValue::Boolean(b) => DatabaseValue::Bool(*b),
        FieldValue::Json(v) => DatabaseValue::String(v.to_string()),
        FieldValue::Null => DatabaseValue::Null,
    }
}

fn conversion(column: &str, e: impl std::fmt::Display) -> DbError {
    DbError::Conversion {
        message: format!("Failed to read column {column}: {e}"),
    }
}

fn row_string(row: &Row, column: &str) -> Result<String, DbError> {
    row.to_value::<String>(column)
        .map_err(|e| conversion(column, e))
}

fn row_opt_string(row: &Row, column: &str) -> Option<String> {
    row.to_value::<Option<String>>(column).unwrap_or(None)
}

fn row_count(row: &Row, column: &str) -> u64 {
    row.to_value::<i64>(column)
        .ok()
        .and_then(|v| u64::try_from(v).ok())
        .unwrap_or(0)
}

fn row_opt_count(row: &Row, column: &str) -> Option<u64> {
    row.to_value::<Option<i64>>(column)
        .unwrap_or(None)
        .and_then(|v| u64::try_from(v).ok())
}

fn row_opt_timestamp(row: &Row, column: &str) -> Option<DateTime<Utc>> {
    row.to_value::<Option<NaiveDateTime>>(column)
        .unwrap_or(None)
        .map(|n| DateTime::<Utc>::from_naive_utc_and_offset(n, Utc))
}

fn row_to_progress(row: &Row) -> Result<FetchProgress, DbError> {
    let source = row_string(row, "source")?;
    let status = row_string(row, "status")?;

    Ok(FetchProgress {
        source: source.parse().map_err(|e| conversion("source", e))?,
        data_type: row_string(row, "data_type")?,
        status: status.parse().map_err(|e| conversion("status", e))?,
        current_page: row_count(row, "current_page"),
        total_pages: row_opt_count(row, "total_pages"),
        items_fetched: row_count(row, "items_fetched"),
        total_items: row_opt_count(row, "total_items"),
        error_message: row_opt_string(row, "error_message"),
        start_url: row_opt_string(row, "start_url"),
        next_page_url: row_opt_string(row, "next_page_url"),
        run_token: row_opt_string(row, "run_token"),
        lease_expires_at: row_opt_timestamp(row, "lease_expires_at"),
        last_fetched_at: row_opt_timestamp(row, "last_fetched_at"),
    })
}

fn row_to_task(row: &Row) -> Result<FileDownloadTask, DbError> {
    let status = row_string(row, "status")?;

    Ok(FileDownloadTask {
        id: row.to_value("id").map_err(|e| conversion("id", e))?,
        file_url: row_string(row, "file_url")?,
        bucket: row_string(row, "bucket")?,
        storage_path: row_string(row, "storage_path")?,
        table_name: row_string(row, "table_name")?,
        record_id: row
            .to_value("record_id")
            .map_err(|e| conversion("record_id", e))?,
        column_name: row_string(row, "column_name")?,
        status: status.parse().map_err(|e| conversion("status", e))?,
        attempts: u32::try_from(row_count(row, "attempts")).unwrap_or(u32::MAX),
        max_attempts: u32::try_from(row_count(row, "max_attempts")).unwrap_or(u32::MAX),
        error_message: row_opt_string(row, "error_message"),
        created_at: row_opt_timestamp(row, "created_at"),
        started_at: row_opt_timestamp(row, "started_at"),
        completed_at: row_opt_timestamp(row, "completed_at"),
    })
}

fn returning_id(rows: &[Row], what: &str) -> Result<i64, DbError> {
    let row = rows.first().ok_or_else(|| DbError::Conversion {
        message: format!("Failed to get {what} id from RETURNING"),
    })?;
    row.to_value("id").map_err(|e| conversion("id", e))
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl RecordSink for PgStore {
    async fn upsert_record(&self, record: &MappedRecord) -> Result<i64, DbError> {
        validate_identifiers(
            &record.table,
            record
                .fields
                .keys()
                .map(String::as_str)
                .chain([record.conflict_key.as_str()]),
        )?;

        let mut columns = Vec::with_capacity(record.fields.len());
        let mut values = String::new();
        let mut params = Vec::with_capacity(record.fields.len());

        for (index, (column, value)) in record.fields.iter().enumerate() {
            if index > 0 {
                values.push_str(", ");
            }
            let n = index + 1;
            if matches!(value, FieldValue::Json(_)) {
                let _ = write!(values, "(${n}::text)::jsonb");
            } else {
                let _ = write!(values, "${n}");
            }
            columns.push(column.as_str());
            params.push(field_value(value));
        }

        let mut updates: Vec<String> = columns
            .iter()
            .filter(|c| **c != record.conflict_key)
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();
        updates.push("updated_at = (NOW() AT TIME ZONE 'UTC')".to_string());

        let sql = format!(
            "INSERT INTO {table} ({columns}) VALUES ({values})
             ON CONFLICT ({key}) DO UPDATE SET {updates}
             RETURNING id",
            table = record.table,
            columns = columns.join(", "),
            key = record.conflict_key,
            updates = updates.join(", "),
        );

        let rows = self.db.query_raw_params(&sql, &params).await?;
        returning_id(&rows, &record.table)
    }

    async fn set_column(
        &self,
        table: &str,
        record_id: i64,
        column: &str,
        value: &str,
    ) -> Result<(), DbError> {
        validate_identifiers(table, [column])?;

        let sql = format!(
            "UPDATE {table} SET {column} = $1, updated_at = (NOW() AT TIME ZONE 'UTC')
             WHERE id = $2"
        );
        self.db
            .exec_raw_params(
                &sql,
                &[
                    DatabaseValue::String(value.to_string()),
                    DatabaseValue::Int64(record_id),
                ],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProgressLedger for PgStore {
    async fn get_progress(
        &self,
        source: DataSource,
        data_type: &str,
    ) -> Result<Option<FetchProgress>, DbError> {
        let rows = self
            .db
            .query_raw_params(
                &format!(
                    "SELECT {PROGRESS_COLUMNS} FROM data_fetch_progress
                     WHERE source = $1 AND data_type = $2"
                ),
                &[
                    DatabaseValue::String(source.to_string()),
                    DatabaseValue::String(data_type.to_string()),
                ],
            )
            .await?;

        rows.first().map(row_to_progress).transpose()
    }

    async fn update_progress(
        &self,
        source: DataSource,
        data_type: &str,
        update: &ProgressUpdate,
    ) -> Result<(), DbError> {
        let mut columns = vec!["source", "data_type", "last_fetched_at"];
        let mut params = vec![
            DatabaseValue::String(source.to_string()),
            DatabaseValue::String(data_type.to_string()),
            timestamp(Utc::now()),
        ];

        if let Some(status) = update.status {
            columns.push("status");
            params.push(DatabaseValue::String(status.to_string()));
        }
        if let Some(page) = update.current_page {
            columns.push("current_page");
            params.push(count_value(page));
        }
        if let Some(total) = update.total_pages {
            columns.push("total_pages");
            params.push(opt_count(total));
        }
        if let Some(items) = update.items_fetched {
            columns.push("items_fetched");
            params.push(count_value(items));
        }
        if let Some(total) = update.total_items {
            columns.push("total_items");
            params.push(opt_count(total));
        }
        if let Some(message) = &update.error_message {
            columns.push("error_message");
            params.push(opt_str(message.as_deref()));
        }
        if let Some(url) = &update.start_url {
            columns.push("start_url");
            params.push(opt_str(url.as_deref()));
        }
        if let Some(url) = &update.next_page_url {
            columns.push("next_page_url");
            params.push(opt_str(url.as_deref()));
        }

        let updates = columns[2..]
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "INSERT INTO data_fetch_progress ({columns}) VALUES ({values})
             ON CONFLICT (source, data_type) DO UPDATE SET {updates}",
            columns = columns.join(", "),
            values = placeholders(params.len()),
        );

        self.db.exec_raw_params(&sql, &params).await?;
        Ok(())
    }

    async fn list_progress(
        &self,
        source: Option<DataSource>,
    ) -> Result<Vec<FetchProgress>, DbError> {
        let rows = match source {
            Some(source) => {
                self.db
                    .query_raw_params(
                        &format!(
                            "SELECT {PROGRESS_COLUMNS} FROM data_fetch_progress
                             WHERE source = $1 ORDER BY data_type"
                        ),
                        &[DatabaseValue::String(source.to_string())],
                    )
                    .await?
            }
            None => {
                self.db
                    .query_raw_params(
                        &format!(
                            "SELECT {PROGRESS_COLUMNS} FROM data_fetch_progress
                             ORDER BY source, data_type"
                        ),
                        &[],
                    )
                    .await?
            }
        };

        rows.iter().map(row_to_progress).collect()
    }

    async fn should_stop(&self, source: DataSource, data_type: &str) -> Result<bool, DbError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT should_stop FROM data_fetch_control
                 WHERE source = $1 AND data_type = $2",
                &[
                    DatabaseValue::String(source.to_string()),
                    DatabaseValue::String(data_type.to_string()),
                ],
            )
            .await?;

        Ok(rows
            .first()
            .and_then(|r| r.to_value::<bool>("should_stop").ok())
            .unwrap_or(false))
    }

    async fn set_stop_flag(
        &self,
        source: DataSource,
        data_type: &str,
        should_stop: bool,
    ) -> Result<(), DbError> {
        self.db
            .exec_raw_params(
                "INSERT INTO data_fetch_control (source, data_type, should_stop, updated_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (source, data_type) DO UPDATE SET
                     should_stop = EXCLUDED.should_stop,
                     updated_at = EXCLUDED.updated_at",
                &[
                    DatabaseValue::String(source.to_string()),
                    DatabaseValue::String(data_type.to_string()),
                    DatabaseValue::Bool(should_stop),
                    timestamp(Utc::now()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn reset_progress(&self, source: DataSource, data_type: &str) -> Result<(), DbError> {
        // One statement so both tables change together.
        self.db
            .exec_raw_params(
                "WITH progress AS (
                     INSERT INTO data_fetch_progress (
                         source, data_type, status, current_page, total_pages,
                         items_fetched, total_items, error_message, start_url,
                         next_page_url, run_token, lease_expires_at, last_fetched_at
                     ) VALUES ($1, $2, 'pending', 0, NULL, 0, NULL, NULL, NULL, NULL, NULL, NULL, $3)
                     ON CONFLICT (source, data_type) DO UPDATE SET
                         status = 'pending',
                         current_page = 0,
                         total_pages = NULL,
                         items_fetched = 0,
                         total_items = NULL,
                         error_message = NULL,
                         start_url = NULL,
                         next_page_url = NULL,
                         run_token = NULL,
                         lease_expires_at = NULL,
                         last_fetched_at = EXCLUDED.last_fetched_at
                     RETURNING 1
                 )
                 INSERT INTO data_fetch_control (source, data_type, should_stop, updated_at)
                 VALUES ($1, $2, FALSE, $3)
                 ON CONFLICT (source, data_type) DO UPDATE SET
                     should_stop = FALSE,
                     updated_at = EXCLUDED.updated_at",
                &[
                    DatabaseValue::String(source.to_string()),
                    DatabaseValue::String(data_type.to_string()),
                    timestamp(Utc::now()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_progress(&self, source: DataSource, data_type: &str) -> Result<bool, DbError> {
        let deleted = self
            .db
            .exec_raw_params(
                "WITH control AS (
                     DELETE FROM data_fetch_control WHERE source = $1 AND data_type = $2
                 )
                 DELETE FROM data_fetch_progress WHERE source = $1 AND data_type = $2",
                &[
                    DatabaseValue::String(source.to_string()),
                    DatabaseValue::String(data_type.to_string()),
                ],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn claim_run(
        &self,
        source: DataSource,
        data_type: &str,
        token: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let rows = self
            .db
            .query_raw_params(
                "INSERT INTO data_fetch_progress (
                     source, data_type, run_token, lease_expires_at, last_fetched_at
                 ) VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (source, data_type) DO UPDATE SET
                     run_token = EXCLUDED.run_token,
                     lease_expires_at = EXCLUDED.lease_expires_at
                 WHERE data_fetch_progress.run_token IS NULL
                    OR data_fetch_progress.run_token = EXCLUDED.run_token
                    OR data_fetch_progress.lease_expires_at IS NULL
                    OR data_fetch_progress.lease_expires_at < $5
                 RETURNING run_token",
                &[
                    DatabaseValue::String(source.to_string()),
                    DatabaseValue::String(data_type.to_string()),
                    DatabaseValue::String(token.to_string()),
                    timestamp(lease_until),
                    timestamp(now),
                ],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn release_run(
        &self,
        source: DataSource,
        data_type: &str,
        token: &str,
    ) -> Result<(), DbError> {
        self.db
            .exec_raw_params(
                "UPDATE data_fetch_progress SET run_token = NULL, lease_expires_at = NULL
                 WHERE source = $1 AND data_type = $2 AND run_token = $3",
                &[
                    DatabaseValue::String(source.to_string()),
                    DatabaseValue::String(data_type.to_string()),
                    DatabaseValue::String(token.to_string()),
                ],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FileQueue for PgStore {
    async fn enqueue(&self, task: &NewFileDownloadTask) -> Result<i64, DbError> {
        let rows = self
            .db
            .query_raw_params(
                "INSERT INTO file_download_queue (
                     file_url, bucket, storage_path, table_name, record_id,
                     column_name, status, attempts, max_attempts, created_at
                 ) VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, $8)
                 RETURNING id",
                &[
                    DatabaseValue::String(task.file_url.clone()),
                    DatabaseValue::String(task.bucket.clone()),
                    DatabaseValue::String(task.storage_path.clone()),
                    DatabaseValue::String(task.table_name.clone()),
                    DatabaseValue::Int64(task.record_id),
                    DatabaseValue::String(task.column_name.clone()),
                    DatabaseValue::Int64(i64::from(task.max_attempts)),
                    timestamp(Utc::now()),
                ],
            )
            .await?;
        returning_id(&rows, "file_download_queue")
    }

    async fn claim_pending(
        &self,
        limit: u32,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<FileDownloadTask>, DbError> {
        // SKIP LOCKED lets concurrent workers claim disjoint batches.
        let rows = self
            .db
            .query_raw_params(
                &format!(
                    "UPDATE file_download_queue SET status = 'processing', started_at = $2
                     WHERE id IN (
                         SELECT id FROM file_download_queue
                         WHERE status = 'pending'
                            OR (status = 'processing'
                                AND (started_at IS NULL OR started_at <= $3))
                         ORDER BY created_at, id
                         LIMIT $1
                         FOR UPDATE SKIP LOCKED
                     )
                     RETURNING {TASK_COLUMNS}"
                ),
                &[
                    DatabaseValue::Int64(i64::from(limit)),
                    timestamp(Utc::now()),
                    timestamp(stale_before),
                ],
            )
            .await?;

        let mut tasks = rows.iter().map(row_to_task).collect::<Result<Vec<_>, _>>()?;
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    async fn mark_completed(&self, id: i64) -> Result<(), DbError> {
        self.db
            .exec_raw_params(
                "UPDATE file_download_queue
                 SET status = 'completed', completed_at = $2, error_message = NULL
                 WHERE id = $1",
                &[DatabaseValue::Int64(id), timestamp(Utc::now())],
            )
            .await?;
        Ok(())
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<TaskStatus, DbError> {
        let rows = self
            .db
            .query_raw_params(
                "UPDATE file_download_queue SET
                     attempts = attempts + 1,
                     status = CASE WHEN attempts + 1 >= max_attempts
                                   THEN 'failed' ELSE 'pending' END,
                     error_message = $2
                 WHERE id = $1
                 RETURNING status",
                &[
                    DatabaseValue::Int64(id),
                    DatabaseValue::String(error.to_string()),
                ],
            )
            .await?;

        let row = rows.first().ok_or_else(|| DbError::Conversion {
            message: format!("No file download task with id {id}"),
        })?;
        row_string(row, "status")?
            .parse()
            .map_err(|e| conversion("status", e))
    }

    async fn reset_failed(&self) -> Result<u64, DbError> {
        Ok(self
            .db
            .exec_raw_params(
                "UPDATE file_download_queue
                 SET status = 'pending', attempts = 0, error_message = NULL
                 WHERE status = 'failed'",
                &[],
            )
            .await?)
    }

    async fn queue_stats(&self) -> Result<QueueStats, DbError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT status, COUNT(*) AS cnt FROM file_download_queue GROUP BY status",
                &[],
            )
            .await?;

        let mut stats = QueueStats::default();
        for row in &rows {
            let status: TaskStatus = row_string(row, "status")?
                .parse()
                .map_err(|e| conversion("status", e))?;
            stats.add(status, row_count(row, "cnt"));
        }
        Ok(stats)
    }
}

#[async_trait]
impl AuditLog for PgStore {
    async fn append_log(&self, entry: &ApiLogEntry) -> Result<(), DbError> {
        self.db
            .exec_raw_params(
                "INSERT INTO api_log (source, endpoint, status, record_count, error_summary, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    DatabaseValue::String(entry.source.to_string()),
                    DatabaseValue::String(entry.endpoint.clone()),
                    DatabaseValue::String(entry.status.to_string()),
                    count_value(entry.record_count),
                    opt_str(entry.error_summary.as_deref()),
                    timestamp(Utc::now()),
                ],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AccessDirectory for PgStore {
    async fn principal_for_token(&self, token: &str) -> Result<Option<Principal>, DbError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT t.user_id, r.role
                 FROM api_tokens t
                 LEFT JOIN user_roles r ON r.user_id = t.user_id
                 WHERE t.token_hash = $1",
                &[DatabaseValue::String(hash_token(token))],
            )
            .await?;

        let Some(first) = rows.first() else {
            return Ok(None);
        };

        let user_id = row_string(first, "user_id")?;
        let mut roles = Vec::new();
        for row in &rows {
            if let Some(role) = row_opt_string(row, "role") {
                match role.parse::<Role>() {
                    Ok(role) => roles.push(role),
                    Err(_) => log::warn!("Ignoring unknown role {role:?} for user {user_id}"),
                }
            }
        }

        Ok(Some(Principal { user_id, roles }))
    }

    async fn register_token(
        &self,
        token: &str,
        user_id: &str,
        roles: &[Role],
    ) -> Result<(), DbError> {
        self.db
            .exec_raw_params(
                "INSERT INTO api_tokens (token_hash, user_id, created_at) VALUES ($1, $2, $3)
                 ON CONFLICT (token_hash) DO UPDATE SET user_id = EXCLUDED.user_id",
                &[
                    DatabaseValue::String(hash_token(token)),
                    DatabaseValue::String(user_id.to_string()),
                    timestamp(Utc::now()),
                ],
            )
            .await?;

        for role in roles {
            self.db
                .exec_raw_params(
                    "INSERT INTO user_roles (user_id, role) VALUES ($1, $2)
                     ON CONFLICT (user_id, role) DO NOTHING",
                    &[
                        DatabaseValue::String(user_id.to_string()),
                        DatabaseValue::String(role.to_string()),
                    ],
                )
                .await?;
        }
        Ok(())
    }
}
