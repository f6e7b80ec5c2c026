#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Object storage for downloaded attachments.
//!
//! Files are written by `(bucket, path)` and overwrite any existing object
//! at the same path, so a duplicate download is harmless. Every put returns
//! the object's public URL, which the file worker writes back onto the
//! owning record.
//!
//! # Environment Variables
//!
//! | Variable | Required | Description |
//! |---|---|---|
//! | `STORAGE_ENDPOINT_URL` | Yes | S3-compatible endpoint |
//! | `STORAGE_ACCESS_KEY_ID` | Yes | Access key |
//! | `STORAGE_SECRET_ACCESS_KEY` | Yes | Secret key |
//! | `STORAGE_PUBLIC_BASE_URL` | No | Base for public URLs (defaults to the endpoint) |

use std::collections::BTreeMap;
use std::sync::{LazyLock, Mutex, PoisonError};

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::{Credentials, StalledStreamProtectionConfig};
use regex::Regex;

/// Errors that can occur during object storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Missing required environment variable.
    #[error("Missing environment variable: {name}")]
    MissingEnv {
        /// Name of the missing environment variable.
        name: String,
    },

    /// `PutObject` failed.
    #[error("Failed to upload {bucket}/{key}: {source}")]
    Upload {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The storage path was empty after sanitization.
    #[error("Empty storage path")]
    EmptyPath,
}

/// Bucket-scoped put-by-path storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes `bytes` at `bucket`/`path`, replacing any existing object,
    /// and returns the object's public URL.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the write fails.
    async fn put(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<String, StorageError>;
}

static UNSAFE_CHARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[:"*?<>|]"#).expect("valid regex"));

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

static SLASHES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/{2,}").expect("valid regex"));

/// Makes a storage path safe for object keys.
///
/// Replaces `: " * ? < > |` with `-`, collapses whitespace runs to `_`,
/// collapses repeated slashes, and strips leading and trailing slashes.
/// Segment order is preserved.
#[must_use]
pub fn sanitize_storage_path(path: &str) -> String {
    let replaced = UNSAFE_CHARS_RE.replace_all(path, "-");
    let spaced = WHITESPACE_RE.replace_all(&replaced, "_");
    let collapsed = SLASHES_RE.replace_all(&spaced, "/");
    collapsed.trim_matches('/').to_string()
}

/// Joins a public base URL, bucket, and key.
#[must_use]
pub fn public_url(base: &str, bucket: &str, key: &str) -> String {
    format!("{}/{bucket}/{key}", base.trim_end_matches('/'))
}

fn require_env(name: &str) -> Result<String, StorageError> {
    std::env::var(name).map_err(|_| StorageError::MissingEnv {
        name: name.to_string(),
    })
}

/// S3-compatible object store.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    public_base_url: String,
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("public_base_url", &self.public_base_url)
            .finish_non_exhaustive()
    }
}

impl S3ObjectStore {
    /// Creates a client from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MissingEnv`] if any required variable is
    /// unset.
    pub fn from_env() -> Result<Self, StorageError> {
        let endpoint = require_env("STORAGE_ENDPOINT_URL")?;
        let access_key = require_env("STORAGE_ACCESS_KEY_ID")?;
        let secret_key = require_env("STORAGE_SECRET_ACCESS_KEY")?;
        let public_base_url =
            std::env::var("STORAGE_PUBLIC_BASE_URL").unwrap_or_else(|_| endpoint.clone());

        let creds = Credentials::new(&access_key, &secret_key, None, None, "storage-env");

        let config = aws_sdk_s3::Config::builder()
            .endpoint_url(&endpoint)
            .region(Region::new("auto"))
            .credentials_provider(creds)
            .force_path_style(true)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .build();

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(config),
            public_base_url,
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<String, StorageError> {
        let key = sanitize_storage_path(path);
        if key.is_empty() {
            return Err(StorageError::EmptyPath);
        }

        let size = bytes.len();
        let body = aws_sdk_s3::primitives::ByteStream::from(bytes);

        self.client
            .put_object()
            .bucket(bucket)
            .key(&key)
            .body(body)
            .content_type(content_type.unwrap_or("application/octet-stream"))
            .send()
            .await
            .map_err(|e| StorageError::Upload {
                bucket: bucket.to_string(),
                key: key.clone(),
                source: Box::new(e),
            })?;

        log::debug!("Uploaded {bucket}/{key} ({size} bytes)");

        Ok(public_url(&self.public_base_url, bucket, &key))
    }
}

/// A stored object held by [`MemoryObjectStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object contents.
    pub bytes: Vec<u8>,
    /// Content type given at upload.
    pub content_type: Option<String>,
}

/// In-process object store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
}

impl MemoryObjectStore {
    /// Public URL base used for stored objects.
    pub const BASE_URL: &'static str = "memory://storage";

    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the object at `bucket`/`key`, if any.
    #[must_use]
    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// All stored keys in `bucket`, sorted.
    #[must_use]
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<String, StorageError> {
        let key = sanitize_storage_path(path);
        if key.is_empty() {
            return Err(StorageError::EmptyPath);
        }

        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (bucket.to_string(), key.clone()),
                StoredObject {
                    bytes,
                    content_type: content_type.map(str::to_string),
                },
            );

        Ok(public_url(Self::BASE_URL, bucket, &key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_reserved_characters() {
        assert_eq!(
            sanitize_storage_path("/rattsdokument/foo:bar.pdf"),
            "rattsdokument/foo-bar.pdf"
        );
        assert_eq!(
            sanitize_storage_path(r#"a/b"c*d?e<f>g|h.pdf"#),
            "a/b-c-d-e-f-g-h.pdf"
        );
    }

    #[test]
    fn collapses_whitespace_and_slashes() {
        assert_eq!(
            sanitize_storage_path("pressmeddelanden//abc/min  fil\t.pdf/"),
            "pressmeddelanden/abc/min_fil_.pdf"
        );
    }

    #[test]
    fn preserves_segment_order() {
        let out = sanitize_storage_path("x/y z/w?");
        let segments: Vec<&str> = out.split('/').collect();
        assert_eq!(segments, ["x", "y_z", "w-"]);
    }

    #[test]
    fn public_url_trims_trailing_slash() {
        assert_eq!(
            public_url("https://cdn.example/", "riksdagen-images", "ledamoter/1.jpg"),
            "https://cdn.example/riksdagen-images/ledamoter/1.jpg"
        );
    }

    #[tokio::test]
    async fn memory_store_overwrites_by_path() {
        let store = MemoryObjectStore::new();
        let first = store
            .put("bucket", "/a/b:c.pdf", b"one".to_vec(), None)
            .await
            .unwrap();
        let second = store
            .put("bucket", "a/b:c.pdf", b"two".to_vec(), Some("application/pdf"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first, "memory://storage/bucket/a/b-c.pdf");
        assert_eq!(store.keys("bucket"), vec!["a/b-c.pdf".to_string()]);
        let object = store.get("bucket", "a/b-c.pdf").unwrap();
        assert_eq!(object.bytes, b"two");
        assert_eq!(object.content_type.as_deref(), Some("application/pdf"));
    }

    #[tokio::test]
    async fn empty_paths_are_rejected() {
        let store = MemoryObjectStore::new();
        assert!(matches!(
            store.put("bucket", "///", Vec::new(), None).await,
            Err(StorageError::EmptyPath)
        ));
    }
}
