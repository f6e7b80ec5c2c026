//! The pagination driver.
//!
//! One invocation walks at most [`PAGE_BUDGET`] pages (fewer with an
//! explicit page cap), strictly in order. After every page the progress
//! row is updated with the page count, the stored item count, and the next
//! page cursor, so a later invocation can continue where this one ended.
//! Termination always follows the next page pointer; reported totals are
//! only recorded for display.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use riksdata_database::store::IngestStore;
use riksdata_database_models::{
    ApiLogEntry, ApiLogStatus, DataSourceKey, FetchProgress, FetchStatus, ProgressUpdate,
};
use riksdata_ingest_models::{IngestRequest, RunOutcome, RunSummary};
use riksdata_source::SourceError;
use riksdata_source::adapter::{ParsedPage, SourceAdapter};
use riksdata_source::fetch::PageFetcher;
use riksdata_source::progress::{ProgressCallback, null_progress};
use riksdata_source::retry::RetryPolicy;
use riksdata_source_models::DataSource;
use tokio_util::sync::CancellationToken;

use crate::IngestError;
use crate::cancel::StopSignal;
use crate::enqueue::enqueue_attachments;

/// Maximum pages processed by one invocation.
pub const PAGE_BUDGET: u32 = 5;

/// Pause between consecutive page fetches.
pub const PAGE_DELAY: Duration = Duration::from_millis(100);

/// How long a run lease lasts without renewal. Renewed before every page.
pub const RUN_LEASE: Duration = Duration::from_secs(15 * 60);

/// Counters for one invocation.
#[derive(Debug, Default)]
struct RunState {
    /// Pages processed by this invocation.
    pages: u64,
    /// Persisted page counter, continued across resumed invocations.
    current_page: u64,
    /// Persisted stored-item counter, continued across resumed invocations.
    items_fetched: u64,
    inserted: u64,
    errors: u64,
    files_queued: u64,
    files_failed: u64,
    /// Whether the progress row has been reset or resumed for this run.
    started: bool,
    /// Whether totals are already recorded for this run.
    totals_known: bool,
    resumed: bool,
    /// First page URL, recorded when a fresh run starts.
    start_url: Option<String>,
}

impl RunState {
    fn fresh(first_url: &str) -> Self {
        Self {
            start_url: Some(first_url.to_string()),
            ..Self::default()
        }
    }

    fn resume(progress: &FetchProgress) -> Self {
        Self {
            current_page: progress.current_page,
            items_fetched: progress.items_fetched,
            totals_known: true,
            resumed: true,
            ..Self::default()
        }
    }
}

/// Statuses a run can be continued from when a cursor is persisted.
const fn is_resumable(status: FetchStatus) -> bool {
    matches!(
        status,
        FetchStatus::InProgress | FetchStatus::Stopped | FetchStatus::Failed
    )
}

/// Walks one source's pages into the store.
pub struct FetchDriver<'a> {
    store: &'a dyn IngestStore,
    fetcher: &'a dyn PageFetcher,
    retry: RetryPolicy,
    page_budget: u32,
    page_delay: Duration,
    lease: Duration,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressCallback>,
}

impl<'a> FetchDriver<'a> {
    /// Creates a driver with the default budget, delay, and retry policy.
    #[must_use]
    pub fn new(store: &'a dyn IngestStore, fetcher: &'a dyn PageFetcher) -> Self {
        Self {
            store,
            fetcher,
            retry: RetryPolicy::default(),
            page_budget: PAGE_BUDGET,
            page_delay: PAGE_DELAY,
            lease: RUN_LEASE,
            cancel: CancellationToken::new(),
            progress: null_progress(),
        }
    }

    /// Overrides the retry policy.
    #[must_use]
    pub const fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the page budget.
    #[must_use]
    pub const fn page_budget(mut self, pages: u32) -> Self {
        self.page_budget = pages;
        self
    }

    /// Overrides the delay between pages.
    #[must_use]
    pub const fn page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    /// Overrides the run lease duration.
    #[must_use]
    pub const fn lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Sets the process-local cancellation token.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sets the progress reporter.
    #[must_use]
    pub fn progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Runs one bounded invocation for `source`.
    ///
    /// Validation happens before any state is touched. The stream's run
    /// lease is held for the duration of the walk.
    ///
    /// # Errors
    ///
    /// * [`IngestError::InvalidDataType`] / [`IngestError::InvalidRequest`]
    ///   for bad input.
    /// * [`IngestError::AlreadyRunning`] if another invocation holds the
    ///   lease.
    /// * [`IngestError::Fetch`] if a page could not be fetched within the
    ///   retry ceiling. Progress is marked failed first.
    /// * [`IngestError::Database`] if the progress ledger is unreachable.
    pub async fn run(
        &self,
        source: DataSource,
        request: &IngestRequest,
    ) -> Result<RunSummary, IngestError> {
        if request.max_pages == Some(0) {
            return Err(IngestError::InvalidRequest {
                message: "maxPages must be at least 1".to_string(),
            });
        }

        let adapter = SourceAdapter::resolve(source, &request.data_type)?;
        let key = DataSourceKey::new(source, adapter.data_type());
        let first_url = adapter.first_page_url(&request.filters)?;

        let token = uuid::Uuid::new_v4().to_string();
        if !self.claim(&key, &token).await? {
            log::warn!("[{key}] Rejecting invocation: another run holds the lease");
            return Err(IngestError::AlreadyRunning { key });
        }

        let result = self.walk(&adapter, &key, &token, request, first_url).await;

        if let Err(e) = self
            .store
            .release_run(key.source, &key.data_type, &token)
            .await
        {
            log::warn!("[{key}] Failed to release run lease: {e}");
        }

        result
    }

    async fn claim(&self, key: &DataSourceKey, token: &str) -> Result<bool, IngestError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.lease)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let until = now.checked_add_signed(lease).unwrap_or(now);
        Ok(self
            .store
            .claim_run(key.source, &key.data_type, token, now, until)
            .await?)
    }

    #[allow(clippy::too_many_lines)]
    async fn walk(
        &self,
        adapter: &SourceAdapter,
        key: &DataSourceKey,
        token: &str,
        request: &IngestRequest,
        first_url: String,
    ) -> Result<RunSummary, IngestError> {
        let existing = self.store.get_progress(key.source, &key.data_type).await?;

        let (mut state, mut url) = match existing {
            Some(progress)
                if request.paginate
                    && is_resumable(progress.status)
                    && progress.next_page_url.is_some()
                    && progress.start_url.as_deref() == Some(first_url.as_str()) =>
            {
                let url = progress.next_page_url.clone().unwrap_or(first_url);
                log::info!(
                    "[{key}] Resuming after page {} at {url}",
                    progress.current_page
                );
                (RunState::resume(&progress), url)
            }
            Some(progress) if progress.next_page_url.is_some() && request.paginate => {
                log::info!(
                    "[{key}] Filters differ from the stored run; starting over at {first_url}"
                );
                (RunState::fresh(&first_url), first_url)
            }
            _ => (RunState::fresh(&first_url), first_url),
        };

        let limit = u64::from(
            request
                .max_pages
                .map_or(self.page_budget, |cap| cap.min(self.page_budget)),
        );
        let stop = StopSignal::new(self.store, key, self.cancel.clone());
        self.progress.set_message(key.to_string());

        let outcome = loop {
            if state.pages >= limit {
                break RunOutcome::Partial;
            }
            if stop.is_stopped().await? {
                break RunOutcome::Stopped;
            }
            if !self.claim(key, token).await? {
                log::warn!("[{key}] Run lease was taken over; ending run");
                return Err(IngestError::AlreadyRunning { key: key.clone() });
            }

            if !state.started {
                self.start(key, &state).await?;
                state.started = true;
            }
            if state.pages > 0 && !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }

            log::info!("[{key}] Fetching page {}...", state.current_page + 1);
            let page = match self.fetch(adapter, key, &url, request.paginate).await {
                Ok(page) => page,
                Err(e) => {
                    self.fail(key, &state, &e).await;
                    return Err(IngestError::Fetch {
                        key: key.clone(),
                        source: e,
                    });
                }
            };

            match self.process_page(adapter, key, page, &mut state).await? {
                Some(next) => url = next,
                None => break RunOutcome::Complete,
            }
        };

        self.finish(key, outcome, &state).await
    }

    /// Resets counters for a fresh run, or marks a resumed run in progress.
    async fn start(&self, key: &DataSourceKey, state: &RunState) -> Result<(), IngestError> {
        let update = if state.resumed {
            ProgressUpdate::default()
                .status(FetchStatus::InProgress)
                .error_message(None)
        } else {
            ProgressUpdate::default()
                .status(FetchStatus::InProgress)
                .current_page(0)
                .items_fetched(0)
                .totals(None, None)
                .error_message(None)
                .start_url(state.start_url.clone())
                .next_page_url(None)
        };
        self.store
            .update_progress(key.source, &key.data_type, &update)
            .await?;
        Ok(())
    }

    async fn fetch(
        &self,
        adapter: &SourceAdapter,
        key: &DataSourceKey,
        url: &str,
        paginate: bool,
    ) -> Result<ParsedPage, SourceError> {
        let label = format!("[{key}] {url}");
        let fetcher = self.fetcher;
        self.retry
            .run(&label, move || async move {
                let body = fetcher.fetch_page(url).await?;
                adapter.parse_page(&body, paginate)
            })
            .await
    }

    /// Upserts one page's records, queues their attachments, and persists
    /// progress. Returns the next page URL.
    async fn process_page(
        &self,
        adapter: &SourceAdapter,
        key: &DataSourceKey,
        page: ParsedPage,
        state: &mut RunState,
    ) -> Result<Option<String>, IngestError> {
        let page_number = state.current_page + 1;
        let mut inserted = 0u64;
        let mut errors = 0u64;

        for record in page.records {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("[{key}] Skipping item on page {page_number}: {e}");
                    errors += 1;
                    continue;
                }
            };

            match self.store.upsert_record(&record).await {
                Ok(record_id) => {
                    inserted += 1;
                    if !record.attachments.is_empty() {
                        let queued = enqueue_attachments(
                            self.store,
                            adapter.base_origin(),
                            adapter.table(),
                            record_id,
                            &record.attachments,
                        )
                        .await;
                        state.files_queued += queued.queued;
                        state.files_failed += queued.failed;
                    }
                }
                Err(e) => {
                    log::warn!(
                        "[{key}] Failed to store {} on page {page_number}: {e}",
                        record.natural_key
                    );
                    errors += 1;
                }
            }
        }

        if page.parse_failed {
            log::warn!("[{key}] Page {page_number} could not be parsed; ending pagination");
        }
        let next = if page.parse_failed {
            None
        } else {
            page.next_page
        };

        state.pages += 1;
        state.current_page = page_number;
        state.items_fetched += inserted;
        state.inserted += inserted;
        state.errors += errors;

        let mut update = ProgressUpdate::default()
            .status(if next.is_some() {
                FetchStatus::InProgress
            } else {
                FetchStatus::Completed
            })
            .current_page(state.current_page)
            .items_fetched(state.items_fetched)
            .next_page_url(next.clone());

        if !state.totals_known {
            let meta = page.metadata;
            if let Some(total) = meta.total_pages {
                self.progress.set_total(total);
            }
            if meta.total_pages.is_some() || meta.total_items.is_some() {
                log::info!(
                    "[{key}] Source reports {} items over {} pages",
                    meta.total_items
                        .map_or_else(|| "?".to_string(), |n| n.to_string()),
                    meta.total_pages
                        .map_or_else(|| "?".to_string(), |n| n.to_string()),
                );
            }
            update = update.totals(meta.total_pages, meta.total_items);
            state.totals_known = true;
        }

        self.store
            .update_progress(key.source, &key.data_type, &update)
            .await?;
        self.progress.inc(1);

        log::info!("[{key}] Page {page_number} done: {inserted} stored, {errors} errors");

        Ok(next)
    }

    async fn fail(&self, key: &DataSourceKey, state: &RunState, error: &SourceError) {
        log::error!(
            "[{key}] Giving up on page {}: {error}",
            state.current_page + 1
        );

        let update = ProgressUpdate::default()
            .status(FetchStatus::Failed)
            .error_message(Some(error.to_string()));
        if let Err(e) = self
            .store
            .update_progress(key.source, &key.data_type, &update)
            .await
        {
            log::error!("[{key}] Failed to record failure: {e}");
        }

        self.audit(key, ApiLogStatus::Failed, state, Some(error.to_string()))
            .await;
        self.progress.finish(format!("{key} failed"));
    }

    async fn finish(
        &self,
        key: &DataSourceKey,
        outcome: RunOutcome,
        state: &RunState,
    ) -> Result<RunSummary, IngestError> {
        let log_status = match outcome {
            RunOutcome::Complete => {
                self.store
                    .set_stop_flag(key.source, &key.data_type, false)
                    .await?;
                ApiLogStatus::Success
            }
            RunOutcome::Partial => ApiLogStatus::Partial,
            RunOutcome::Stopped => {
                self.store
                    .update_progress(
                        key.source,
                        &key.data_type,
                        &ProgressUpdate::default().status(FetchStatus::Stopped),
                    )
                    .await?;
                ApiLogStatus::Stopped
            }
        };

        let summary = RunSummary {
            key: key.clone(),
            inserted: state.inserted,
            errors: state.errors,
            pages: state.pages,
            outcome,
            files_queued: state.files_queued,
            files_failed: state.files_failed,
        };

        let error_summary = (state.errors > 0).then(|| format!("{} errors", state.errors));
        self.audit(key, log_status, state, error_summary).await;

        let message = summary.message();
        log::info!(
            "[{key}] {message} ({} errors, {} files queued)",
            state.errors,
            state.files_queued
        );
        self.progress.finish(message);

        Ok(summary)
    }

    async fn audit(
        &self,
        key: &DataSourceKey,
        status: ApiLogStatus,
        state: &RunState,
        error_summary: Option<String>,
    ) {
        let entry = ApiLogEntry {
            source: key.source,
            endpoint: key.data_type.clone(),
            status,
            record_count: state.inserted,
            error_summary,
        };
        if let Err(e) = self.store.append_log(&entry).await {
            log::warn!("[{key}] Failed to write audit log entry: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use riksdata_database::memory::MemoryStore;
    use riksdata_database::store::{FileQueue, ProgressLedger};
    use riksdata_ingest_models::IngestResponse;
    use riksdata_source_models::{FetchFilters, FieldValue};
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone)]
    enum Reply {
        Body(String),
        Status(u16),
    }

    /// Serves canned replies per URL. The last reply for a URL repeats.
    #[derive(Default)]
    struct FakeFetcher {
        replies: Mutex<BTreeMap<String, VecDeque<Reply>>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        fn reply(self, url: &str, reply: Reply) -> Self {
            self.replies
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(reply);
            self
        }

        fn body(self, url: &str, body: String) -> Self {
            self.reply(url, Reply::Body(body))
        }

        fn replace(&self, url: &str, body: String) {
            self.replies
                .lock()
                .unwrap()
                .insert(url.to_string(), VecDeque::from([Reply::Body(body)]));
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for FakeFetcher {
        async fn fetch_page(&self, url: &str) -> Result<String, SourceError> {
            self.calls.lock().unwrap().push(url.to_string());
            let reply = {
                let mut replies = self.replies.lock().unwrap();
                let queue = replies.get_mut(url);
                match queue {
                    Some(queue) if queue.len() > 1 => queue.pop_front(),
                    Some(queue) => queue.front().cloned(),
                    None => None,
                }
            };
            match reply {
                Some(Reply::Body(body)) => Ok(body),
                Some(Reply::Status(status)) => Err(SourceError::Status {
                    status,
                    url: url.to_string(),
                }),
                None => Err(SourceError::Status {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn first_url(source: DataSource, data_type: &str) -> String {
        SourceAdapter::resolve(source, data_type)
            .unwrap()
            .first_page_url(&FetchFilters::default())
            .unwrap()
    }

    fn page_url(n: u32) -> String {
        format!("https://data.riksdagen.se/dokumentlista/?utformat=json&p={n}")
    }

    fn dokument_page(items: &[serde_json::Value], pages: u32, next: Option<&str>) -> String {
        let mut list = json!({
            "@sidor": pages.to_string(),
            "@traffar": (pages * 10).to_string(),
            "dokument": items,
        });
        if let Some(next) = next {
            list["@nasta_sida"] = json!(next);
        }
        json!({ "dokumentlista": list }).to_string()
    }

    fn ten_items(page: u32) -> Vec<serde_json::Value> {
        (0..10)
            .map(|i| json!({"dok_id": format!("P{page}D{i}"), "titel": format!("Dokument {i}")}))
            .collect()
    }

    /// A chain of `pages` dokument pages, ten items each.
    fn chained_fetcher(pages: u32) -> FakeFetcher {
        let mut fetcher = FakeFetcher::default();
        for n in 1..=pages {
            let url = if n == 1 {
                first_url(DataSource::Riksdagen, "dokument")
            } else {
                page_url(n)
            };
            let next = (n < pages).then(|| page_url(n + 1));
            fetcher = fetcher.body(&url, dokument_page(&ten_items(n), pages, next.as_deref()));
        }
        fetcher
    }

    fn driver<'a>(store: &'a MemoryStore, fetcher: &'a FakeFetcher) -> FetchDriver<'a> {
        FetchDriver::new(store, fetcher)
            .retry_policy(RetryPolicy::immediate())
            .page_delay(Duration::ZERO)
    }

    async fn progress(store: &MemoryStore, data_type: &str) -> FetchProgress {
        store
            .get_progress(DataSource::Riksdagen, data_type)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn page_cap_of_one_reports_partial_progress() {
        let store = MemoryStore::new();
        let fetcher = chained_fetcher(2);

        let summary = driver(&store, &fetcher)
            .run(
                DataSource::Riksdagen,
                &IngestRequest::new("dokument").max_pages(1),
            )
            .await
            .unwrap();

        let response = IngestResponse::from(&summary);
        assert_eq!(response.inserted, 10);
        assert_eq!(response.pages, 1);
        assert!(!response.complete);

        let progress = progress(&store, "dokument").await;
        assert_eq!(progress.current_page, 1);
        assert_eq!(progress.items_fetched, 10);
        assert_eq!(progress.status, FetchStatus::InProgress);
        assert_eq!(progress.next_page_url, Some(page_url(2)));
        assert_eq!(progress.total_pages, Some(2));
        assert_eq!(progress.total_items, Some(20));
        assert_eq!(progress.run_token, None);
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn repeat_invocation_continues_from_cursor() {
        let store = MemoryStore::new();
        let fetcher = chained_fetcher(2);
        let request = IngestRequest::new("dokument").max_pages(1);

        driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &request)
            .await
            .unwrap();
        let second = driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &request)
            .await
            .unwrap();

        assert_eq!(second.outcome, RunOutcome::Complete);
        assert_eq!(second.pages, 1);
        assert_eq!(fetcher.calls()[1], page_url(2));

        let progress = progress(&store, "dokument").await;
        assert_eq!(progress.current_page, 2);
        assert_eq!(progress.items_fetched, 20);
        assert_eq!(progress.status, FetchStatus::Completed);
        assert_eq!(progress.next_page_url, None);
        assert_eq!(store.rows("riksdagen_dokument").len(), 20);
    }

    #[tokio::test]
    async fn changed_filters_start_over_instead_of_resuming() {
        let store = MemoryStore::new();
        let fetcher = chained_fetcher(3);

        driver(&store, &fetcher)
            .run(
                DataSource::Riksdagen,
                &IngestRequest::new("dokument").max_pages(1),
            )
            .await
            .unwrap();
        assert_eq!(
            progress(&store, "dokument").await.start_url,
            Some(first_url(DataSource::Riksdagen, "dokument"))
        );

        let filters = FetchFilters {
            period: Some("2023/24".to_string()),
            ..FetchFilters::default()
        };
        let filtered_url = SourceAdapter::resolve(DataSource::Riksdagen, "dokument")
            .unwrap()
            .first_page_url(&filters)
            .unwrap();
        assert!(filtered_url.contains("rm=2023%2F24"));
        let fetcher = fetcher.body(&filtered_url, dokument_page(&ten_items(9), 1, None));

        let summary = driver(&store, &fetcher)
            .run(
                DataSource::Riksdagen,
                &IngestRequest::new("dokument").filters(filters),
            )
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Complete);
        assert_eq!(fetcher.calls()[1], filtered_url);
        assert!(!fetcher.calls().contains(&page_url(2)));

        let progress = progress(&store, "dokument").await;
        assert_eq!(progress.current_page, 1);
        assert_eq!(progress.items_fetched, 10);
        assert_eq!(progress.start_url, Some(filtered_url));
        assert_eq!(progress.status, FetchStatus::Completed);
    }

    #[tokio::test]
    async fn page_budget_bounds_each_invocation() {
        let store = MemoryStore::new();
        let fetcher = chained_fetcher(7);
        let request = IngestRequest::new("dokument");

        let first = driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &request)
            .await
            .unwrap();
        assert_eq!(first.pages, u64::from(PAGE_BUDGET));
        assert_eq!(first.outcome, RunOutcome::Partial);
        assert_eq!(progress(&store, "dokument").await.status, FetchStatus::InProgress);
        let before = progress(&store, "dokument").await.current_page;

        let second = driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &request)
            .await
            .unwrap();
        assert_eq!(second.pages, 2);
        assert_eq!(second.outcome, RunOutcome::Complete);
        assert!(progress(&store, "dokument").await.current_page > before);
        assert_eq!(progress(&store, "dokument").await.current_page, 7);
    }

    #[tokio::test]
    async fn explicit_cap_above_budget_is_clamped() {
        let store = MemoryStore::new();
        let fetcher = chained_fetcher(7);

        let summary = driver(&store, &fetcher)
            .page_budget(3)
            .run(
                DataSource::Riksdagen,
                &IngestRequest::new("dokument").max_pages(50),
            )
            .await
            .unwrap();
        assert_eq!(summary.pages, 3);
    }

    #[tokio::test]
    async fn stop_flag_ends_run_at_page_boundary() {
        let store = MemoryStore::new();
        let fetcher = chained_fetcher(3);
        let request = IngestRequest::new("dokument").max_pages(1);

        driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &request)
            .await
            .unwrap();
        store
            .set_stop_flag(DataSource::Riksdagen, "dokument", true)
            .await
            .unwrap();

        let summary = driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &request)
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Stopped);
        assert_eq!(summary.pages, 0);
        assert_eq!(fetcher.calls().len(), 1);

        let progress = progress(&store, "dokument").await;
        assert_eq!(progress.status, FetchStatus::Stopped);
        assert_eq!(progress.current_page, 1);
        assert_eq!(progress.next_page_url, Some(page_url(2)));
    }

    #[tokio::test]
    async fn stopped_run_resumes_once_flag_is_cleared() {
        let store = MemoryStore::new();
        let fetcher = chained_fetcher(2);
        let request = IngestRequest::new("dokument").max_pages(1);

        driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &request)
            .await
            .unwrap();
        store
            .set_stop_flag(DataSource::Riksdagen, "dokument", true)
            .await
            .unwrap();
        driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &request)
            .await
            .unwrap();
        store
            .set_stop_flag(DataSource::Riksdagen, "dokument", false)
            .await
            .unwrap();

        let summary = driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &request)
            .await
            .unwrap();
        assert_eq!(summary.outcome, RunOutcome::Complete);
        assert_eq!(progress(&store, "dokument").await.current_page, 2);
    }

    #[tokio::test]
    async fn local_cancellation_stops_before_fetching() {
        let store = MemoryStore::new();
        let fetcher = chained_fetcher(2);
        let token = CancellationToken::new();
        token.cancel();

        let summary = driver(&store, &fetcher)
            .cancellation(token)
            .run(DataSource::Riksdagen, &IngestRequest::new("dokument"))
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Stopped);
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn reingesting_a_key_overwrites_the_row() {
        let store = MemoryStore::new();
        let url = first_url(DataSource::Riksdagen, "dokument");
        let fetcher = FakeFetcher::default().body(
            &url,
            dokument_page(&[json!({"dok_id": "H8B1:23", "titel": "Första"})], 1, None),
        );

        driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &IngestRequest::new("dokument"))
            .await
            .unwrap();

        fetcher.replace(
            &url,
            dokument_page(&[json!({"dok_id": "H8B1:23", "titel": "Andra"})], 1, None),
        );
        let summary = driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &IngestRequest::new("dokument"))
            .await
            .unwrap();

        assert_eq!(summary.inserted, 1);
        assert_eq!(store.rows("riksdagen_dokument").len(), 1);
        let row = store
            .find_row("riksdagen_dokument", "dok_id", "H8B1:23")
            .unwrap();
        assert_eq!(
            row.fields.get("titel"),
            Some(&FieldValue::Text("Andra".to_string()))
        );
    }

    #[tokio::test]
    async fn transient_fetch_errors_are_retried() {
        let store = MemoryStore::new();
        let url = first_url(DataSource::Riksdagen, "dokument");
        let fetcher = FakeFetcher::default()
            .reply(&url, Reply::Status(503))
            .reply(&url, Reply::Status(502))
            .body(&url, dokument_page(&ten_items(1), 1, None));

        let summary = driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &IngestRequest::new("dokument"))
            .await
            .unwrap();

        assert_eq!(summary.inserted, 10);
        assert_eq!(fetcher.calls().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_run() {
        let store = MemoryStore::new();
        let url = first_url(DataSource::Riksdagen, "dokument");
        let fetcher = FakeFetcher::default().reply(&url, Reply::Status(503));

        let err = driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &IngestRequest::new("dokument"))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Fetch { .. }));
        assert_eq!(fetcher.calls().len(), 3);

        let progress = progress(&store, "dokument").await;
        assert_eq!(progress.status, FetchStatus::Failed);
        assert!(progress.error_message.unwrap().contains("503"));
        assert_eq!(progress.run_token, None);

        let log = store.log_entries();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, ApiLogStatus::Failed);
    }

    #[tokio::test]
    async fn item_errors_are_counted_and_skipped() {
        let store = MemoryStore::new().with_required_column("riksdagen_dokument", "titel");
        let url = first_url(DataSource::Riksdagen, "dokument");
        let fetcher = FakeFetcher::default().body(
            &url,
            dokument_page(
                &[
                    json!({"dok_id": "A", "titel": "ok"}),
                    json!({"titel": "no key"}),
                    json!({"dok_id": "B"}),
                    json!({"dok_id": "C", "titel": "ok"}),
                ],
                1,
                None,
            ),
        );

        let summary = driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &IngestRequest::new("dokument"))
            .await
            .unwrap();

        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.errors, 2);
        assert_eq!(summary.outcome, RunOutcome::Complete);
        assert_eq!(
            store.log_entries()[0].error_summary.as_deref(),
            Some("2 errors")
        );
    }

    #[tokio::test]
    async fn attachments_are_queued_against_the_row() {
        let store = MemoryStore::new();
        let url = first_url(DataSource::Riksdagen, "dokument");
        let fetcher = FakeFetcher::default().body(
            &url,
            dokument_page(
                &[json!({
                    "dok_id": "H8B1:23",
                    "dokument_url_text": "//data.riksdagen.se/dokument/H8B123.text"
                })],
                1,
                None,
            ),
        );

        let summary = driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &IngestRequest::new("dokument"))
            .await
            .unwrap();
        assert_eq!(summary.files_queued, 1);

        let row = store
            .find_row("riksdagen_dokument", "dok_id", "H8B1:23")
            .unwrap();
        let tasks = store.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].record_id, row.id);
        assert_eq!(tasks[0].storage_path, "dokument/H8B1-23.pdf");
        assert_eq!(
            tasks[0].file_url,
            "https://data.riksdagen.se/dokument/H8B123.text"
        );
        assert_eq!(store.queue_stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn unparseable_xml_ends_pagination_quietly() {
        let store = MemoryStore::new();
        let url = first_url(DataSource::Riksdagen, "anforanden");
        let fetcher =
            FakeFetcher::default().body(&url, "<anforandelista><anforande>".to_string());

        let summary = driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &IngestRequest::new("anforanden"))
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Complete);
        assert_eq!(summary.pages, 1);
        assert_eq!(summary.inserted, 0);
        assert_eq!(progress(&store, "anforanden").await.status, FetchStatus::Completed);
    }

    #[tokio::test]
    async fn paginate_false_fetches_a_single_page() {
        let store = MemoryStore::new();
        let fetcher = chained_fetcher(3);

        let summary = driver(&store, &fetcher)
            .run(
                DataSource::Riksdagen,
                &IngestRequest::new("dokument").paginate(false),
            )
            .await
            .unwrap();

        assert_eq!(summary.pages, 1);
        assert_eq!(summary.outcome, RunOutcome::Complete);
    }

    #[tokio::test]
    async fn unpaginated_sources_complete_in_one_page() {
        let store = MemoryStore::new();
        let url = first_url(DataSource::Regeringskansliet, "pressmeddelanden");
        let fetcher = FakeFetcher::default().body(
            &url,
            json!([
                {"id": "pm-1", "title": "Ett", "url": "https://www.regeringen.se/pm/1/"},
                {"id": "pm-2", "title": "Två", "url": "https://www.regeringen.se/pm/2/"}
            ])
            .to_string(),
        );

        let summary = driver(&store, &fetcher)
            .run(
                DataSource::Regeringskansliet,
                &IngestRequest::new("pressmeddelanden"),
            )
            .await
            .unwrap();

        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.outcome, RunOutcome::Complete);
        assert_eq!(store.rows("regeringskansliet_pressmeddelanden").len(), 2);
    }

    #[tokio::test]
    async fn completion_clears_the_stop_flag() {
        let store = MemoryStore::new();
        let fetcher = chained_fetcher(1);

        let summary = driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &IngestRequest::new("dokument"))
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Complete);
        assert!(
            !store
                .should_stop(DataSource::Riksdagen, "dokument")
                .await
                .unwrap()
        );
        assert_eq!(store.log_entries()[0].status, ApiLogStatus::Success);
    }

    #[tokio::test]
    async fn overlapping_invocation_is_rejected() {
        let store = MemoryStore::new();
        let fetcher = chained_fetcher(2);
        let now = Utc::now();
        store
            .claim_run(
                DataSource::Riksdagen,
                "dokument",
                "other-run",
                now,
                now + chrono::Duration::minutes(5),
            )
            .await
            .unwrap();

        let err = driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &IngestRequest::new("dokument"))
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert!(fetcher.calls().is_empty());
        assert_eq!(
            progress(&store, "dokument").await.run_token.as_deref(),
            Some("other-run")
        );
    }

    #[tokio::test]
    async fn invalid_requests_touch_no_state() {
        let store = MemoryStore::new();
        let fetcher = FakeFetcher::default();

        let unknown = driver(&store, &fetcher)
            .run(DataSource::Riksdagen, &IngestRequest::new("motioner"))
            .await
            .unwrap_err();
        assert!(unknown.is_client_error());

        let zero = driver(&store, &fetcher)
            .run(
                DataSource::Riksdagen,
                &IngestRequest::new("dokument").max_pages(0),
            )
            .await
            .unwrap_err();
        assert!(zero.is_client_error());

        assert!(store.list_progress(None).await.unwrap().is_empty());
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn underscore_data_types_resolve() {
        let store = MemoryStore::new();
        let url = first_url(DataSource::Regeringskansliet, "ud-avrader");
        let fetcher = FakeFetcher::default().body(&url, "[]".to_string());

        let summary = driver(&store, &fetcher)
            .run(
                DataSource::Regeringskansliet,
                &IngestRequest::new(" ud_avrader "),
            )
            .await
            .unwrap();

        assert_eq!(summary.key.data_type, "ud-avrader");
        assert_eq!(summary.outcome, RunOutcome::Complete);
    }
}
