//! Operator actions on the progress ledger and the file queue.
//!
//! Shared by the CLI subcommands and the HTTP admin routes. Data types are
//! normalized and validated the same way invocation requests are.

use riksdata_database::store::IngestStore;
use riksdata_database_models::{DataSourceKey, FetchProgress, QueueStats};
use riksdata_source::registry::{self, normalize_data_type};
use riksdata_source_models::DataSource;

use crate::IngestError;

fn resolve_key(source: DataSource, data_type: &str) -> Result<DataSourceKey, IngestError> {
    let (_, endpoint) = registry::lookup(source, data_type)?;
    Ok(DataSourceKey::new(source, endpoint.data_type.as_str()))
}

/// Sets the stop flag. A running invocation ends at its next page
/// boundary; later invocations stop before fetching until the flag is
/// cleared, the stream is reset, or a run completes.
///
/// # Errors
///
/// Returns [`IngestError`] if the data type is invalid or the write fails.
pub async fn request_stop(
    store: &dyn IngestStore,
    source: DataSource,
    data_type: &str,
) -> Result<DataSourceKey, IngestError> {
    let key = resolve_key(source, data_type)?;
    store
        .set_stop_flag(key.source, &key.data_type, true)
        .await?;
    log::info!("[{key}] Stop requested");
    Ok(key)
}

/// Clears the stop flag so the next invocation resumes from its cursor.
///
/// # Errors
///
/// Returns [`IngestError`] if the data type is invalid or the write fails.
pub async fn clear_stop(
    store: &dyn IngestStore,
    source: DataSource,
    data_type: &str,
) -> Result<DataSourceKey, IngestError> {
    let key = resolve_key(source, data_type)?;
    store
        .set_stop_flag(key.source, &key.data_type, false)
        .await?;
    log::info!("[{key}] Stop flag cleared");
    Ok(key)
}

/// Resets progress to pending with zeroed counters and no cursor, and
/// clears the stop flag. The next invocation starts from the first page.
///
/// # Errors
///
/// Returns [`IngestError`] if the data type is invalid or the write fails.
pub async fn reset(
    store: &dyn IngestStore,
    source: DataSource,
    data_type: &str,
) -> Result<DataSourceKey, IngestError> {
    let key = resolve_key(source, data_type)?;
    store.reset_progress(key.source, &key.data_type).await?;
    log::info!("[{key}] Progress reset");
    Ok(key)
}

/// Deletes the progress and control rows. Only normalization is applied,
/// so rows of retired data types can still be removed. Returns whether a
/// progress row existed.
///
/// # Errors
///
/// Returns [`IngestError`] if the data type is malformed or the write
/// fails.
pub async fn delete(
    store: &dyn IngestStore,
    source: DataSource,
    data_type: &str,
) -> Result<bool, IngestError> {
    let key = DataSourceKey::new(source, normalize_data_type(data_type)?);
    let existed = store.delete_progress(key.source, &key.data_type).await?;
    if existed {
        log::info!("[{key}] Progress deleted");
    } else {
        log::info!("[{key}] No progress to delete");
    }
    Ok(existed)
}

/// Lists progress rows, optionally for one source.
///
/// # Errors
///
/// Returns [`IngestError::Database`] if the read fails.
pub async fn list_progress(
    store: &dyn IngestStore,
    source: Option<DataSource>,
) -> Result<Vec<FetchProgress>, IngestError> {
    Ok(store.list_progress(source).await?)
}

/// File queue counts per status.
///
/// # Errors
///
/// Returns [`IngestError::Database`] if the read fails.
pub async fn queue_stats(store: &dyn IngestStore) -> Result<QueueStats, IngestError> {
    Ok(store.queue_stats().await?)
}

/// Returns every failed download task to pending with attempts zeroed.
///
/// # Errors
///
/// Returns [`IngestError::Database`] if the write fails.
pub async fn reset_failed(store: &dyn IngestStore) -> Result<u64, IngestError> {
    let count = store.reset_failed().await?;
    log::info!("Reset {count} failed file downloads to pending");
    Ok(count)
}
