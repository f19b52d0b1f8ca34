//! S3-compatible blob store (AWS S3, MinIO, or any other implementation of
//! the S3 API). `new` ensures the configured bucket exists, creating it if
//! not — a head-bucket-or-create check run once at startup rather than on
//! every operation.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;

use crate::constants::object_storage::PRESIGNED_URL_TTL_SECS;

use super::{BlobEntry, BlobError, BlobStore};

pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    /// Build a client from the ambient AWS config (env vars, profile, or an
    /// explicit endpoint override for S3-compatible stores) and ensure
    /// `bucket` exists.
    pub async fn new(bucket: impl Into<String>, endpoint_url: Option<String>) -> Result<Self, BlobError> {
        let bucket = bucket.into();
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        let client = Client::new(&config);

        let store = Self { client, bucket };
        store.ensure_bucket_exists().await?;
        Ok(store)
    }

    async fn ensure_bucket_exists(&self) -> Result<(), BlobError> {
        let head = self.client.head_bucket().bucket(&self.bucket).send().await;
        if head.is_ok() {
            return Ok(());
        }

        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|source| BlobError::Transport {
                key: self.bucket.clone(),
                source: source.into(),
            })?;

        Ok(())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|source| BlobError::Transport { key: key.to_string(), source: source.into() })?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) {
                    BlobError::NotFound { key: key.to_string() }
                } else {
                    BlobError::Transport { key: key.to_string(), source: err.into() }
                }
            })?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|source| BlobError::Transport { key: key.to_string(), source: source.into() })?
            .into_bytes();

        Ok(bytes)
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) => Ok(false),
            Err(source) => Err(BlobError::Transport { key: key.to_string(), source: source.into() }),
        }
    }

    async fn url(&self, key: &str) -> Result<String, BlobError> {
        let presigning = PresigningConfig::expires_in(Duration::from_secs(PRESIGNED_URL_TTL_SECS))
            .map_err(|source| BlobError::Transport { key: key.to_string(), source: source.into() })?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|source| BlobError::Transport { key: key.to_string(), source: source.into() })?;

        Ok(presigned.uri().to_string())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|source| BlobError::Transport { key: key.to_string(), source: source.into() })?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, BlobError> {
        let mut entries = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|source| BlobError::Transport { key: prefix.to_string(), source: source.into() })?;

            for object in output.contents() {
                entries.push(BlobEntry {
                    key: object.key().unwrap_or_default().to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(|dt| chrono::DateTime::from_timestamp(dt.secs(), 0)),
                });
            }

            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(entries)
    }
}
