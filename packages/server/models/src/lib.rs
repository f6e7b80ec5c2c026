#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! API request and response types for the riksdata server's
//! administrative routes.
//!
//! Invocation bodies and results live in `riksdata_ingest_models`; these
//! types cover health and operator endpoints only.

use riksdata_database_models::{FetchProgress, QueueStats};
use riksdata_source_models::DataSource;
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiHealth {
    /// Whether the server is healthy.
    pub healthy: bool,
    /// Server version.
    pub version: String,
}

/// Query parameters for `GET /api/admin/progress`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressQueryParams {
    /// Only list this source.
    pub source: Option<DataSource>,
}

/// Result of a stop, clear-stop, reset, or delete request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminActionResponse {
    /// Always `true`.
    pub success: bool,
    /// What happened.
    pub message: String,
}

impl AdminActionResponse {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// Progress listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressListResponse {
    /// Always `true`.
    pub success: bool,
    /// One row per (source, data type).
    pub progress: Vec<FetchProgress>,
}

/// File queue counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatsResponse {
    /// Always `true`.
    pub success: bool,
    /// Task counts per status.
    pub stats: QueueStats,
}

/// Result of resetting failed downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetFailedResponse {
    /// Always `true`.
    pub success: bool,
    /// Tasks returned to pending.
    pub reset: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_query_parses_source() {
        let params: ProgressQueryParams =
            serde_json::from_str(r#"{"source":"regeringskansliet"}"#).unwrap();
        assert_eq!(params.source, Some(DataSource::Regeringskansliet));
    }
}
