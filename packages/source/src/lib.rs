#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Source adapters for the Swedish open-government data APIs.
//!
//! A [`adapter::SourceAdapter`] binds one registry endpoint (a data type of
//! Riksdagen or of the regeringen.se mirror) to the generic page parser:
//! it builds the first page URL, turns one raw page body into mapped
//! records, and reports the continuation pointer. Remote I/O goes through
//! the [`fetch::PageFetcher`] and [`fetch::BinaryFetcher`] traits so the
//! pagination driver and file worker can be exercised without a network.

pub mod adapter;
pub mod fetch;
pub mod mapping;
pub mod parsing;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod source_def;
pub mod xml;

/// Errors that can occur while fetching or interpreting a remote page.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// HTTP request failed before a status was received.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status {
        /// Numeric HTTP status.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// JSON parsing failed (usually a truncated body).
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A URL from the registry or the payload could not be parsed.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The payload had an unexpected shape.
    #[error("Normalization error: {message}")]
    Normalization {
        /// Description of what went wrong.
        message: String,
    },
}

impl SourceError {
    /// Returns `true` if the error is likely transient and worth retrying.
    ///
    /// Connection failures, timeouts, HTTP 429, and HTTP 5xx are transient.
    /// An unparseable JSON body is treated as a truncated response and
    /// retried. Other 4xx statuses and bad URLs are permanent.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
            }
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Json(_) => true,
            Self::Url(_) | Self::Normalization { .. } => false,
        }
    }
}
