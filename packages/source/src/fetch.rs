//! Remote I/O seams for page and file downloads.
//!
//! The pagination driver depends on [`PageFetcher`] and the file worker on
//! [`BinaryFetcher`]; [`HttpFetcher`] implements both with `reqwest`.

use std::time::Duration;

use async_trait::async_trait;

use crate::SourceError;

/// Fixed per-request timeout for page and file downloads.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("riksdata/", env!("CARGO_PKG_VERSION"));

/// Fetches one page body as text.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Downloads the page at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] on transport failure or a non-success
    /// status.
    async fn fetch_page(&self, url: &str) -> Result<String, SourceError>;
}

/// A downloaded binary file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    /// Raw bytes.
    pub bytes: Vec<u8>,
    /// `Content-Type` reported by the server, if any.
    pub content_type: Option<String>,
}

/// Fetches one binary attachment.
#[async_trait]
pub trait BinaryFetcher: Send + Sync {
    /// Downloads the file at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] on transport failure or a non-success
    /// status.
    async fn fetch_file(&self, url: &str) -> Result<FetchedFile, SourceError>;
}

/// `reqwest`-backed fetcher with a fixed request timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Builds a client with [`REQUEST_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Http`] if the TLS backend fails to initialize.
    pub fn new() -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, SourceError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, SourceError> {
        log::debug!("GET {url}");
        Ok(self.get(url).await?.text().await?)
    }
}

#[async_trait]
impl BinaryFetcher for HttpFetcher {
    async fn fetch_file(&self, url: &str) -> Result<FetchedFile, SourceError> {
        log::debug!("GET {url} (file)");
        let response = self.get(url).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let bytes = response.bytes().await?.to_vec();
        Ok(FetchedFile {
            bytes,
            content_type,
        })
    }
}
