//! Per-worker `{processed, in_flight}` deduplication state.
//!
//! Every worker (Downloader, Recognizer, Classifier) implements the same
//! at-most-once contract: a key already in `processed` short-circuits with
//! a "completed" response; a key already `in_flight` fails fast; otherwise
//! the key is marked in-flight, the work runs, and on success the key moves
//! into `processed` and is persisted to disk. `in_flight` is never persisted
//! — a crashed worker forgets it, and replays land in `processed` via the
//! caller's own existence check (e.g. blob existence for the Downloader).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("failed to read dedup state from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write dedup state to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dedup state at {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

struct State {
    processed: HashSet<String>,
    in_flight: HashSet<String>,
}

/// A persisted set of "processed" keys plus a memory-only "in flight" set.
pub struct DedupSet {
    path: PathBuf,
    state: Mutex<State>,
}

impl DedupSet {
    /// Load the processed set from `path` if it exists, starting empty otherwise.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, DedupError> {
        let path = path.into();
        let processed = if path.exists() {
            let content = fs::read_to_string(&path)
                .await
                .map_err(|source| DedupError::Read {
                    path: path.clone(),
                    source,
                })?;
            let keys: Vec<String> =
                serde_json::from_str(&content).map_err(|source| DedupError::Parse {
                    path: path.clone(),
                    source,
                })?;
            keys.into_iter().collect()
        } else {
            HashSet::new()
        };

        Ok(Self {
            path,
            state: Mutex::new(State {
                processed,
                in_flight: HashSet::new(),
            }),
        })
    }

    pub async fn is_processed(&self, key: &str) -> bool {
        self.state.lock().await.processed.contains(key)
    }

    pub async fn is_in_flight(&self, key: &str) -> bool {
        self.state.lock().await.in_flight.contains(key)
    }

    /// Mark `key` in-flight. Returns `false` without mutating anything if it
    /// was already in-flight (caller should treat this as a duplicate request).
    pub async fn begin(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.in_flight.contains(key) {
            return false;
        }
        state.in_flight.insert(key.to_string());
        true
    }

    /// Release `key` from in-flight without marking it processed (error path).
    pub async fn release(&self, key: &str) {
        self.state.lock().await.in_flight.remove(key);
    }

    /// Move `key` from in-flight to processed and persist the processed set.
    pub async fn complete(&self, key: &str) -> Result<(), DedupError> {
        {
            let mut state = self.state.lock().await;
            state.in_flight.remove(key);
            state.processed.insert(key.to_string());
        }
        self.persist().await
    }

    /// Persist the current processed set via write-tmp-then-rename.
    pub async fn persist(&self) -> Result<(), DedupError> {
        let keys: Vec<String> = {
            let state = self.state.lock().await;
            state.processed.iter().cloned().collect()
        };
        atomic_write_json(&self.path, &keys).await
    }
}

async fn atomic_write_json(path: &Path, keys: &[String]) -> Result<(), DedupError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| DedupError::Write {
                path: path.to_path_buf(),
                source,
            })?;
    }

    let json = serde_json::to_string_pretty(keys).map_err(|source| DedupError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, json)
        .await
        .map_err(|source| DedupError::Write {
            path: temp_path.clone(),
            source,
        })?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|source| DedupError::Write {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn fresh_instance_over_same_directory_sees_persisted_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("downloader_processed_files.json");

        let dedup = DedupSet::load(&path).await.unwrap();
        assert!(dedup.begin("https://ex.com/a.mp3").await);
        dedup.complete("https://ex.com/a.mp3").await.unwrap();

        let reloaded = DedupSet::load(&path).await.unwrap();
        assert!(reloaded.is_processed("https://ex.com/a.mp3").await);
        assert!(!reloaded.is_in_flight("https://ex.com/a.mp3").await);
    }

    #[tokio::test]
    async fn begin_twice_without_release_reports_duplicate() {
        let dir = TempDir::new().unwrap();
        let dedup = DedupSet::load(dir.path().join("state.json")).await.unwrap();

        assert!(dedup.begin("url").await);
        assert!(!dedup.begin("url").await);

        dedup.release("url").await;
        assert!(dedup.begin("url").await);
    }

    #[tokio::test]
    async fn in_flight_is_not_persisted_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let dedup = DedupSet::load(&path).await.unwrap();
        assert!(dedup.begin("url").await);
        // crash: never completes, never persists in_flight

        let reloaded = DedupSet::load(&path).await.unwrap();
        assert!(!reloaded.is_in_flight("url").await);
        assert!(!reloaded.is_processed("url").await);
    }
}
