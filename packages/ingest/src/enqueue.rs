//! Queues attachment downloads found on upserted records.
//!
//! Best effort: a failure to queue one attachment is logged and counted but
//! never fails the page.

use riksdata_database::store::FileQueue;
use riksdata_database_models::{DEFAULT_MAX_ATTEMPTS, NewFileDownloadTask};
use riksdata_source_models::Attachment;
use riksdata_storage::sanitize_storage_path;
use url::Url;

/// Counts from queueing one record's attachments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueSummary {
    /// Tasks inserted.
    pub queued: u64,
    /// Attachments that could not be queued.
    pub failed: u64,
}

/// Resolves a possibly relative attachment URL against `base_origin`.
/// Handles absolute URLs, root-relative paths, and protocol-relative
/// `//host/path` references.
///
/// # Errors
///
/// Returns [`url::ParseError`] if either URL is malformed.
pub fn resolve_url(base_origin: &str, raw: &str) -> Result<String, url::ParseError> {
    let base = Url::parse(base_origin)?;
    Ok(base.join(raw.trim())?.into())
}

/// Builds the queue row for one attachment, or a reason it cannot be
/// queued.
///
/// # Errors
///
/// Returns a description if the URL cannot be resolved or the storage
/// path is empty after sanitization.
pub fn build_task(
    base_origin: &str,
    table: &str,
    record_id: i64,
    attachment: &Attachment,
) -> Result<NewFileDownloadTask, String> {
    let file_url = resolve_url(base_origin, &attachment.url)
        .map_err(|e| format!("cannot resolve {:?}: {e}", attachment.url))?;

    let storage_path = sanitize_storage_path(&attachment.storage_path);
    if storage_path.is_empty() {
        return Err(format!(
            "empty storage path for {:?}",
            attachment.storage_path
        ));
    }

    Ok(NewFileDownloadTask {
        file_url,
        bucket: attachment.bucket.clone(),
        storage_path,
        table_name: table.to_string(),
        record_id,
        column_name: attachment.column.clone(),
        max_attempts: DEFAULT_MAX_ATTEMPTS,
    })
}

/// Queues every attachment of one record.
pub async fn enqueue_attachments<Q: FileQueue + ?Sized>(
    queue: &Q,
    base_origin: &str,
    table: &str,
    record_id: i64,
    attachments: &[Attachment],
) -> EnqueueSummary {
    let mut summary = EnqueueSummary::default();

    for attachment in attachments {
        let task = match build_task(base_origin, table, record_id, attachment) {
            Ok(task) => task,
            Err(reason) => {
                log::warn!("Not queueing attachment for {table}#{record_id}: {reason}");
                summary.failed += 1;
                continue;
            }
        };

        match queue.enqueue(&task).await {
            Ok(id) => {
                log::debug!(
                    "Queued {} -> {}/{} (task {id})",
                    task.file_url,
                    task.bucket,
                    task.storage_path
                );
                summary.queued += 1;
            }
            Err(e) => {
                log::warn!("Failed to queue {} for {table}#{record_id}: {e}", task.file_url);
                summary.failed += 1;
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use riksdata_database::memory::MemoryStore;
    use riksdata_database_models::TaskStatus;

    use super::*;

    fn attachment(url: &str, path: &str) -> Attachment {
        Attachment {
            url: url.to_string(),
            bucket: "riksdagen-images".to_string(),
            storage_path: path.to_string(),
            column: "local_pdf_url".to_string(),
        }
    }

    #[test]
    fn resolves_relative_urls_against_origin() {
        let origin = "https://www.regeringen.se";
        assert_eq!(
            resolve_url(origin, "/contentassets/a.pdf").unwrap(),
            "https://www.regeringen.se/contentassets/a.pdf"
        );
        assert_eq!(
            resolve_url(origin, "//data.riksdagen.se/fil/B.pdf").unwrap(),
            "https://data.riksdagen.se/fil/B.pdf"
        );
        assert_eq!(
            resolve_url(origin, "https://g0v.se/x.pdf").unwrap(),
            "https://g0v.se/x.pdf"
        );
    }

    #[test]
    fn storage_paths_are_sanitized() {
        let task = build_task(
            "https://data.riksdagen.se",
            "riksdagen_dokument",
            7,
            &attachment("/dokument/foo.pdf", "/rattsdokument/foo:bar.pdf"),
        )
        .unwrap();

        assert_eq!(task.storage_path, "rattsdokument/foo-bar.pdf");
        assert_eq!(task.file_url, "https://data.riksdagen.se/dokument/foo.pdf");
        assert_eq!(task.record_id, 7);
        assert_eq!(task.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn queues_pending_tasks_and_counts_failures() {
        let store = MemoryStore::new();
        let summary = enqueue_attachments(
            &store,
            "https://data.riksdagen.se",
            "riksdagen_dokument",
            3,
            &[
                attachment("/a.pdf", "dokument/a.pdf"),
                attachment("/b.pdf", "///"),
            ],
        )
        .await;

        assert_eq!(summary, EnqueueSummary { queued: 1, failed: 1 });
        let tasks = store.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(tasks[0].attempts, 0);
        assert_eq!(tasks[0].column_name, "local_pdf_url");
    }
}
