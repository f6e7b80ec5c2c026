#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Ingestion core for Swedish government open data.
//!
//! [`driver::FetchDriver`] walks a source's pages within a fixed page
//! budget, upserting mapped records and persisting progress after every
//! page. Attachments found on records are queued by [`enqueue`] and
//! downloaded later by [`worker::FileWorker`]. [`admin`] holds the
//! operator actions shared by the CLI and the HTTP server.

pub mod admin;
pub mod cancel;
pub mod driver;
pub mod enqueue;
pub mod worker;

use riksdata_database::DbError;
use riksdata_database_models::DataSourceKey;
use riksdata_source::SourceError;
use riksdata_source::registry::DataTypeError;

/// Errors that end an invocation.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The requested data type is empty, too long, or unknown.
    #[error(transparent)]
    InvalidDataType(#[from] DataTypeError),

    /// Some other part of the request is invalid.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// What was wrong.
        message: String,
    },

    /// Another invocation holds the run lease for this stream.
    #[error("A run for {key} is already in flight")]
    AlreadyRunning {
        /// The contended stream.
        key: DataSourceKey,
    },

    /// A page could not be fetched within the retry ceiling.
    #[error("Fetch failed for {key}: {source}")]
    Fetch {
        /// The stream being walked.
        key: DataSourceKey,
        /// The last fetch error.
        source: SourceError,
    },

    /// Source registry or URL error.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Storage error.
    #[error(transparent)]
    Database(#[from] DbError),
}

impl IngestError {
    /// Returns `true` for errors caused by the request itself. These are
    /// raised before any state is touched.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidDataType(_) | Self::InvalidRequest { .. }
        )
    }

    /// Returns `true` when the stream is busy.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. })
    }
}
