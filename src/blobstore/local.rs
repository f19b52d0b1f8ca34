//! Filesystem-backed blob store. Keys are sanitized into flat filenames
//! under a root directory; writes go through the same write-tmp-then-rename
//! pattern as `storage::json::JsonStorage::atomic_write`.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;

use super::{BlobEntry, BlobError, BlobStore};

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(sanitize_key(key))
    }
}

/// Keys are caller-provided content hashes (e.g. `md5(url)`), but we still
/// guard against path traversal rather than trust that blindly.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| BlobError::Io { key: key.to_string(), source })?;
        }

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &data)
            .await
            .map_err(|source| BlobError::Io { key: key.to_string(), source })?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|source| BlobError::Io { key: key.to_string(), source })?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound { key: key.to_string() })
            }
            Err(source) => Err(BlobError::Io { key: key.to_string(), source }),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        Ok(fs::metadata(self.path_for(key)).await.is_ok())
    }

    async fn url(&self, key: &str) -> Result<String, BlobError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Err(BlobError::NotFound { key: key.to_string() });
        }
        Ok(format!("file://{}", path.display()))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BlobError::Io { key: key.to_string(), source }),
        }
    }

    /// Keys are flattened into filenames (see [`sanitize_key`]), so listing
    /// filters filenames by the same sanitization rather than a true
    /// hierarchical prefix match.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, BlobError> {
        let sanitized_prefix = sanitize_key(prefix);
        let mut entries = Vec::new();

        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(source) => return Err(BlobError::Io { key: prefix.to_string(), source }),
        };

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|source| BlobError::Io { key: prefix.to_string(), source })?
        {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !file_name.starts_with(&sanitized_prefix) || file_name.ends_with(".tmp") {
                continue;
            }

            let metadata = entry
                .metadata()
                .await
                .map_err(|source| BlobError::Io { key: file_name.clone(), source })?;

            entries.push(BlobEntry {
                key: file_name,
                size: metadata.len(),
                last_modified: metadata.modified().ok().map(chrono::DateTime::<chrono::Utc>::from),
            });
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_then_get_round_trips_bytes() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());

        store.put("abc123", Bytes::from_static(b"hello")).await.unwrap();
        let data = store.get("abc123").await.unwrap();

        assert_eq!(&data[..], b"hello");
        assert!(store.exists("abc123").await.unwrap());
    }

    #[tokio::test]
    async fn get_missing_key_returns_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());

        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());

        store.put("key", Bytes::from_static(b"x")).await.unwrap();
        store.delete("key").await.unwrap();
        store.delete("key").await.unwrap();

        assert!(!store.exists("key").await.unwrap());
    }

    #[tokio::test]
    async fn keys_with_path_separators_are_sanitized_into_a_flat_filename() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());

        store.put("../../etc/passwd", Bytes::from_static(b"x")).await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let entry = entries.next_entry().await.unwrap().unwrap();
        assert!(!entry.path().to_string_lossy().contains(".."));
    }

    #[tokio::test]
    async fn list_returns_only_keys_with_the_matching_prefix() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path());

        store.put("podcasts/abc", Bytes::from_static(b"a")).await.unwrap();
        store.put("podcasts/abc.transcript.json", Bytes::from_static(b"t")).await.unwrap();
        store.put("other/xyz", Bytes::from_static(b"x")).await.unwrap();

        let entries = store.list("podcasts/").await.unwrap();

        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.key.starts_with("podcasts_")));
    }
}
