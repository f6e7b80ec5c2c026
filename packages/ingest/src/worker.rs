//! Attachment download worker.
//!
//! Claims a batch of pending tasks, downloads each file, writes it to
//! object storage, and back-fills the owning row's column with the public
//! URL. Failed attempts return the task to pending until its attempt
//! ceiling, after which it stays failed until an administrative reset.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use riksdata_database::store::IngestStore;
use riksdata_database_models::{FileDownloadTask, TaskStatus};
use riksdata_ingest_models::FileQueueSummary;
use riksdata_source::fetch::BinaryFetcher;
use riksdata_source::progress::{ProgressCallback, null_progress};
use riksdata_storage::ObjectStore;

use crate::IngestError;

/// Tasks claimed per invocation.
pub const DEFAULT_BATCH_SIZE: u32 = 50;

/// How long a task may sit in processing before another run reclaims it.
pub const PROCESSING_LEASE: Duration = Duration::from_secs(30 * 60);

/// Processes one batch of the file download queue.
pub struct FileWorker<'a> {
    store: &'a dyn IngestStore,
    fetcher: &'a dyn BinaryFetcher,
    objects: &'a dyn ObjectStore,
    batch_size: u32,
    processing_lease: Duration,
    progress: Arc<dyn ProgressCallback>,
}

impl<'a> FileWorker<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn IngestStore,
        fetcher: &'a dyn BinaryFetcher,
        objects: &'a dyn ObjectStore,
    ) -> Self {
        Self {
            store,
            fetcher,
            objects,
            batch_size: DEFAULT_BATCH_SIZE,
            processing_lease: PROCESSING_LEASE,
            progress: null_progress(),
        }
    }

    /// Overrides the batch size.
    #[must_use]
    pub const fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Overrides how long an abandoned processing task is left alone
    /// before it is claimed again.
    #[must_use]
    pub const fn processing_lease(mut self, lease: Duration) -> Self {
        self.processing_lease = lease;
        self
    }

    /// Sets the progress reporter.
    #[must_use]
    pub fn progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Claims and processes one batch.
    ///
    /// Per-task failures are recorded on the task and never fail the batch.
    /// Tasks left in processing by an interrupted run are claimed again once
    /// their processing lease has passed.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Database`] if tasks cannot be claimed or a
    /// task's outcome cannot be recorded. The unfinished rest of the batch
    /// is returned to the queue first.
    pub async fn run(&self) -> Result<FileQueueSummary, IngestError> {
        let lease = chrono::Duration::from_std(self.processing_lease)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let tasks = self
            .store
            .claim_pending(self.batch_size, Utc::now() - lease)
            .await?;
        let mut summary = FileQueueSummary::default();

        if tasks.is_empty() {
            log::info!("File queue is empty");
            self.progress.finish("No pending files".to_string());
            return Ok(summary);
        }

        log::info!("Processing {} queued files", tasks.len());
        self.progress.set_total(tasks.len() as u64);

        for (index, task) in tasks.iter().enumerate() {
            self.progress.set_message(task.storage_path.clone());

            if let Err(e) = self.settle(task, &mut summary).await {
                self.release(&tasks[index..], &e).await;
                return Err(e);
            }

            self.progress.inc(1);
        }

        log::info!(
            "File batch done: {} processed, {} failed, {} requeued",
            summary.processed,
            summary.failed,
            summary.requeued
        );
        self.progress.finish(format!(
            "{} stored, {} failed",
            summary.processed, summary.failed
        ));

        Ok(summary)
    }

    /// Runs one task and records its outcome.
    async fn settle(
        &self,
        task: &FileDownloadTask,
        summary: &mut FileQueueSummary,
    ) -> Result<(), IngestError> {
        match self.process(task).await {
            Ok(public_url) => {
                self.store.mark_completed(task.id).await?;
                log::debug!(
                    "Stored {} -> {public_url} ({}#{})",
                    task.file_url,
                    task.table_name,
                    task.record_id
                );
                summary.processed += 1;
            }
            Err(reason) => {
                let status = self.store.record_failure(task.id, &reason).await?;
                if status == TaskStatus::Failed {
                    log::error!(
                        "Giving up on {} after {} attempts: {reason}",
                        task.file_url,
                        task.attempts + 1
                    );
                    summary.failed += 1;
                } else {
                    log::warn!(
                        "Attempt {}/{} for {} failed: {reason}",
                        task.attempts + 1,
                        task.max_attempts,
                        task.file_url
                    );
                    summary.requeued += 1;
                }
            }
        }
        Ok(())
    }

    /// Best-effort hand-back of claimed tasks after the batch aborted.
    /// Anything this cannot record is reclaimed once its lease passes.
    async fn release(&self, remaining: &[FileDownloadTask], cause: &IngestError) {
        log::warn!(
            "File batch aborted with {} tasks unfinished: {cause}",
            remaining.len()
        );
        for task in remaining {
            if let Err(e) = self
                .store
                .record_failure(task.id, &format!("batch aborted: {cause}"))
                .await
            {
                log::warn!("Could not release task {}: {e}", task.id);
            }
        }
    }

    /// Downloads, stores, and back-fills one task. Returns the public URL,
    /// or the reason the attempt failed.
    async fn process(&self, task: &FileDownloadTask) -> Result<String, String> {
        let file = self
            .fetcher
            .fetch_file(&task.file_url)
            .await
            .map_err(|e| e.to_string())?;

        if file.bytes.is_empty() {
            return Err(format!("empty response from {}", task.file_url));
        }

        let public_url = self
            .objects
            .put(
                &task.bucket,
                &task.storage_path,
                file.bytes,
                file.content_type.as_deref(),
            )
            .await
            .map_err(|e| e.to_string())?;

        self.store
            .set_column(
                &task.table_name,
                task.record_id,
                &task.column_name,
                &public_url,
            )
            .await
            .map_err(|e| format!("stored but back-fill failed: {e}"))?;

        Ok(public_url)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use riksdata_database::memory::MemoryStore;
    use riksdata_database::store::{FileQueue, RecordSink};
    use riksdata_database_models::{DEFAULT_MAX_ATTEMPTS, NewFileDownloadTask};
    use riksdata_source::SourceError;
    use riksdata_source::fetch::FetchedFile;
    use riksdata_source_models::{FieldValue, MappedRecord};
    use riksdata_storage::MemoryObjectStore;

    use super::*;

    /// Serves fixed files; unknown URLs answer 503.
    #[derive(Default)]
    struct FakeFiles {
        files: BTreeMap<String, Vec<u8>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeFiles {
        fn with(mut self, url: &str, bytes: &[u8]) -> Self {
            self.files.insert(url.to_string(), bytes.to_vec());
            self
        }
    }

    #[async_trait]
    impl BinaryFetcher for FakeFiles {
        async fn fetch_file(&self, url: &str) -> Result<FetchedFile, SourceError> {
            self.calls.lock().unwrap().push(url.to_string());
            self.files.get(url).map_or_else(
                || {
                    Err(SourceError::Status {
                        status: 503,
                        url: url.to_string(),
                    })
                },
                |bytes| {
                    Ok(FetchedFile {
                        bytes: bytes.clone(),
                        content_type: Some("application/pdf".to_string()),
                    })
                },
            )
        }
    }

    async fn seed(store: &MemoryStore, file_url: &str) -> i64 {
        let record = MappedRecord::new("riksdagen_dokument", "dok_id", "H8B1:23".to_string())
            .with_text("titel", Some("Dokument".to_string()));
        let record_id = store.upsert_record(&record).await.unwrap();

        store
            .enqueue(&NewFileDownloadTask {
                file_url: file_url.to_string(),
                bucket: "riksdagen-images".to_string(),
                storage_path: "dokument/H8B1-23.pdf".to_string(),
                table_name: "riksdagen_dokument".to_string(),
                record_id,
                column_name: "local_pdf_url".to_string(),
                max_attempts: DEFAULT_MAX_ATTEMPTS,
            })
            .await
            .unwrap();

        record_id
    }

    #[tokio::test]
    async fn stores_file_and_back_fills_column() {
        let store = MemoryStore::new();
        let objects = MemoryObjectStore::new();
        let url = "https://data.riksdagen.se/dokument/H8B123.pdf";
        let fetcher = FakeFiles::default().with(url, b"%PDF-1.7");
        seed(&store, url).await;

        let summary = FileWorker::new(&store, &fetcher, &objects)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 0);

        let stored = objects
            .get("riksdagen-images", "dokument/H8B1-23.pdf")
            .unwrap();
        assert_eq!(stored.bytes, b"%PDF-1.7".to_vec());

        let row = store
            .find_row("riksdagen_dokument", "dok_id", "H8B1:23")
            .unwrap();
        assert_eq!(
            row.fields.get("local_pdf_url"),
            Some(&FieldValue::Text(format!(
                "{}/riksdagen-images/dokument/H8B1-23.pdf",
                MemoryObjectStore::BASE_URL
            )))
        );

        let task = &store.tasks()[0];
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn failures_requeue_until_the_attempt_ceiling() {
        let store = MemoryStore::new();
        let objects = MemoryObjectStore::new();
        let fetcher = FakeFiles::default();
        seed(&store, "https://data.riksdagen.se/missing.pdf").await;
        let worker = FileWorker::new(&store, &fetcher, &objects);

        let first = worker.run().await.unwrap();
        assert_eq!(first.requeued, 1);
        assert_eq!(store.tasks()[0].status, TaskStatus::Pending);
        assert_eq!(store.tasks()[0].attempts, 1);

        worker.run().await.unwrap();
        let third = worker.run().await.unwrap();
        assert_eq!(third.failed, 1);

        let task = &store.tasks()[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(task.error_message.as_deref().unwrap().contains("503"));

        let after = worker.run().await.unwrap();
        assert_eq!(after, FileQueueSummary::default());
        assert_eq!(fetcher.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn reset_failed_tasks_are_retried() {
        let store = MemoryStore::new();
        let objects = MemoryObjectStore::new();
        let url = "https://data.riksdagen.se/late.pdf";
        seed(&store, url).await;

        let broken = FakeFiles::default();
        let worker = FileWorker::new(&store, &broken, &objects);
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            worker.run().await.unwrap();
        }
        assert_eq!(store.queue_stats().await.unwrap().failed, 1);

        assert_eq!(store.reset_failed().await.unwrap(), 1);
        let fixed = FakeFiles::default().with(url, b"data");
        let summary = FileWorker::new(&store, &fixed, &objects)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(store.queue_stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn batch_size_limits_claimed_tasks() {
        let store = MemoryStore::new();
        let objects = MemoryObjectStore::new();
        let url = "https://data.riksdagen.se/a.pdf";
        let fetcher = FakeFiles::default().with(url, b"a");
        seed(&store, url).await;
        seed(&store, url).await;

        let summary = FileWorker::new(&store, &fetcher, &objects)
            .batch_size(1)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(store.queue_stats().await.unwrap().pending, 1);
    }

    /// Serves the first file, then never answers again.
    #[derive(Default)]
    struct StallingFiles {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BinaryFetcher for StallingFiles {
        async fn fetch_file(&self, _url: &str) -> Result<FetchedFile, SourceError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                std::future::pending::<()>().await;
            }
            Ok(FetchedFile {
                bytes: b"data".to_vec(),
                content_type: None,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_batch_is_reclaimed_after_its_lease() {
        let store = MemoryStore::new();
        let objects = MemoryObjectStore::new();
        let url = "https://data.riksdagen.se/dokument/H8B123.pdf";
        for _ in 0..3 {
            seed(&store, url).await;
        }

        let stalling = StallingFiles::default();
        let interrupted = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            FileWorker::new(&store, &stalling, &objects).run(),
        )
        .await;
        assert!(interrupted.is_err());

        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.processing, 2);

        let fetcher = FakeFiles::default().with(url, b"%PDF-1.7");
        let within_lease = FileWorker::new(&store, &fetcher, &objects)
            .run()
            .await
            .unwrap();
        assert_eq!(within_lease, FileQueueSummary::default());

        let summary = FileWorker::new(&store, &fetcher, &objects)
            .processing_lease(Duration::ZERO)
            .run()
            .await
            .unwrap();
        assert_eq!(summary.processed, 2);

        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.processing, 0);
    }
}
