//! Blob storage abstraction for downloaded audio and rendered output.
//!
//! Mirrors `storage::Storage`'s shape (a `Send + Sync` async trait with an
//! associated error type) but for content-addressed-by-caller byte blobs
//! rather than podcast/episode records. Two backends: `local` (filesystem,
//! atomic write-tmp-then-rename, `file://` URLs) and `s3` (any S3-compatible
//! object store via `aws-sdk-s3`, presigned GET URLs).

pub mod local;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use local::LocalBlobStore;
pub use s3::S3BlobStore;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob {key} not found")]
    NotFound { key: String },
    #[error("blob transport error for {key}: {source}")]
    Transport {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("blob io error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Content-addressed-by-caller blob storage. Every method takes a `key` the
/// caller computed itself (e.g. `md5(source_url)`); the store never derives
/// keys on its own.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`, replacing any existing blob. Implementations
    /// write atomically: a reader never observes a partially written blob.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError>;

    /// Fetch the full contents of `key`.
    async fn get(&self, key: &str) -> Result<Bytes, BlobError>;

    /// Whether `key` has been stored.
    async fn exists(&self, key: &str) -> Result<bool, BlobError>;

    /// A URL a client can use to fetch `key` directly (a `file://` path for
    /// the local backend, a time-limited presigned GET for S3).
    async fn url(&self, key: &str) -> Result<String, BlobError>;

    /// Remove `key`. Removing a key that doesn't exist is not an error.
    async fn delete(&self, key: &str) -> Result<(), BlobError>;

    /// List every blob whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, BlobError>;
}

pub type BoxedBlobStore = Box<dyn BlobStore>;

/// One entry returned by [`BlobStore::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct BlobEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
}
