#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Invocation request, response, and run summary types.

use riksdata_database_models::DataSourceKey;
use riksdata_source_models::FetchFilters;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

const fn default_paginate() -> bool {
    true
}

/// Body of an ingestion invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    /// Data type to fetch. Trimmed, and `_` normalized to `-`, before
    /// lookup.
    #[serde(default)]
    pub data_type: String,
    /// Follow next page pointers. Defaults to `true`.
    #[serde(default = "default_paginate")]
    pub paginate: bool,
    /// Explicit page cap for this invocation.
    #[serde(default)]
    pub max_pages: Option<u32>,
    /// Query filters passed through to the remote endpoint.
    #[serde(default)]
    pub filters: FetchFilters,
}

impl IngestRequest {
    /// Creates a request for `data_type` with default options.
    #[must_use]
    pub fn new(data_type: impl Into<String>) -> Self {
        Self {
            data_type: data_type.into(),
            paginate: true,
            max_pages: None,
            filters: FetchFilters::default(),
        }
    }

    /// Sets the page cap.
    #[must_use]
    pub const fn max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    /// Enables or disables pagination.
    #[must_use]
    pub const fn paginate(mut self, paginate: bool) -> Self {
        self.paginate = paginate;
        self
    }

    /// Sets the query filters.
    #[must_use]
    pub fn filters(mut self, filters: FetchFilters) -> Self {
        self.filters = filters;
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunOutcome {
    /// No next page pointer remained.
    Complete,
    /// The page budget or page cap ran out with pages remaining.
    Partial,
    /// The stop flag or a local cancellation was observed.
    Stopped,
}

/// Aggregate counts of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Source and data type that ran.
    #[serde(flatten)]
    pub key: DataSourceKey,
    /// Records upserted.
    pub inserted: u64,
    /// Items that failed to map or upsert.
    pub errors: u64,
    /// Pages processed by this invocation.
    pub pages: u64,
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Attachment downloads queued.
    pub files_queued: u64,
    /// Attachment downloads that could not be queued.
    pub files_failed: u64,
}

impl RunSummary {
    /// Human-readable completion message.
    #[must_use]
    pub fn message(&self) -> String {
        let base = format!(
            "Fetched and stored {} {} records over {} pages",
            self.inserted, self.key.data_type, self.pages
        );
        match self.outcome {
            RunOutcome::Complete => base,
            RunOutcome::Partial => {
                format!("{base}; more pages remain, invoke again to continue")
            }
            RunOutcome::Stopped => format!("{base}; stopped on request"),
        }
    }
}

/// Successful invocation response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    /// Always `true`.
    pub success: bool,
    /// Records upserted.
    pub inserted: u64,
    /// Items that failed to map or upsert.
    pub errors: u64,
    /// Pages processed.
    pub pages: u64,
    /// `true` only when the data was walked to the end.
    pub complete: bool,
    /// Completion message.
    pub message: String,
}

impl From<&RunSummary> for IngestResponse {
    fn from(summary: &RunSummary) -> Self {
        Self {
            success: true,
            inserted: summary.inserted,
            errors: summary.errors,
            pages: summary.pages,
            complete: summary.outcome == RunOutcome::Complete,
            message: summary.message(),
        }
    }
}

/// Failed invocation response. Carries a generic message and the
/// correlation id under which the detail was logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Always `false`.
    pub success: bool,
    /// Generic error message.
    pub error: String,
    /// Correlation id.
    pub request_id: String,
}

impl ErrorResponse {
    /// Creates a failure response.
    #[must_use]
    pub fn new(error: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            request_id: request_id.into(),
        }
    }
}

/// Counts from one file worker batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileQueueSummary {
    /// Tasks stored and back-written.
    pub processed: u64,
    /// Tasks that reached their attempt ceiling in this batch.
    pub failed: u64,
    /// Tasks returned to pending for a later batch.
    pub requeued: u64,
}

/// Response of a file worker invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileQueueResponse {
    /// Always `true`.
    pub success: bool,
    /// Tasks stored and back-written.
    pub processed: u64,
    /// Tasks that reached their attempt ceiling.
    pub failed: u64,
    /// Tasks returned to pending.
    pub requeued: u64,
    /// Summary message.
    pub message: String,
}

impl From<FileQueueSummary> for FileQueueResponse {
    fn from(summary: FileQueueSummary) -> Self {
        Self {
            success: true,
            processed: summary.processed,
            failed: summary.failed,
            requeued: summary.requeued,
            message: format!(
                "Processed {} files, {} failed, {} requeued",
                summary.processed, summary.failed, summary.requeued
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use riksdata_source_models::DataSource;

    use super::*;

    fn summary(outcome: RunOutcome) -> RunSummary {
        RunSummary {
            key: DataSourceKey::new(DataSource::Riksdagen, "dokument"),
            inserted: 10,
            errors: 0,
            pages: 1,
            outcome,
            files_queued: 0,
            files_failed: 0,
        }
    }

    #[test]
    fn request_defaults_paginate_to_true() {
        let request: IngestRequest =
            serde_json::from_str(r#"{"dataType":"dokument","maxPages":1}"#).unwrap();
        assert!(request.paginate);
        assert_eq!(request.max_pages, Some(1));
        assert_eq!(request.filters, FetchFilters::default());
    }

    #[test]
    fn request_accepts_null_max_pages_and_filters() {
        let request: IngestRequest = serde_json::from_str(
            r#"{"dataType":"voteringar","paginate":false,"maxPages":null,"filters":{"dateFrom":"2024-01-01","pageSize":50}}"#,
        )
        .unwrap();
        assert!(!request.paginate);
        assert_eq!(request.max_pages, None);
        assert_eq!(request.filters.date_from.as_deref(), Some("2024-01-01"));
        assert_eq!(request.filters.page_size, Some(50));
    }

    #[test]
    fn partial_runs_are_not_complete() {
        let response = IngestResponse::from(&summary(RunOutcome::Partial));
        assert!(response.success);
        assert!(!response.complete);
        assert!(response.message.contains("invoke again"));

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["inserted"], 10);
        assert_eq!(value["pages"], 1);
        assert_eq!(value["complete"], false);
    }

    #[test]
    fn complete_runs_report_complete() {
        let response = IngestResponse::from(&summary(RunOutcome::Complete));
        assert!(response.complete);
        assert_eq!(
            response.message,
            "Fetched and stored 10 dokument records over 1 pages"
        );
    }

    #[test]
    fn error_response_uses_camel_case_request_id() {
        let value = serde_json::to_value(ErrorResponse::new("Internal error", "abc")).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["requestId"], "abc");
    }
}
