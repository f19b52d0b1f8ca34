//! Application-wide constants.
//!
//! Centralizes magic numbers used throughout the pipeline so they are easy
//! to find and to cross-check against `Config`'s `Default` impls, which set
//! the same values as a deployment's starting point.

use std::time::Duration;

/// Network-related constants.
pub mod network {
    use super::*;

    /// Default timeout for outbound HTTP requests (RSS fetch, LLM calls).
    pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

    /// Timeout for episode audio downloads (larger files, slower origins).
    pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

    /// Connect timeout shared by every `reqwest::Client` built in the crate.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// User agent string sent with every outbound HTTP request.
    pub const USER_AGENT: &str = concat!("podcleaner/", env!("CARGO_PKG_VERSION"));

    /// Chunk size used when streaming a download to a temp file.
    pub const DOWNLOAD_CHUNK_SIZE: usize = 8192;
}

/// Classifier (ad detection) defaults, matching spec.md §6's `llm.*` keys.
pub mod classifier {
    /// Segments per LLM chunk.
    pub const DEFAULT_CHUNK_SIZE: usize = 600;

    /// Retry attempts per chunk before giving up and recording an error.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// Fixed backoff between retry attempts.
    pub const RETRY_BACKOFF: Duration = Duration::from_secs(2);

    /// Sampling temperature sent to the classifier.
    pub const DEFAULT_TEMPERATURE: f64 = 0.1;
}

/// Audio processing defaults, matching spec.md §6's `audio.*` keys.
pub mod audio {
    /// Minimum merged cut-interval length to keep.
    pub const DEFAULT_MIN_DURATION: f64 = 5.0;

    /// Maximum gap between ad intervals before they stop being merged.
    pub const DEFAULT_MAX_GAP: f64 = 20.0;

    /// Gap tolerance used by the classifier's own block-extraction pass,
    /// which is independent of the audio processor's merge settings.
    pub const COALESCE_GAP_TOLERANCE: f64 = 5.0;
}

/// Object storage defaults, matching spec.md §6's `object_storage.*` keys.
pub mod object_storage {
    /// Connect timeout for the configured backend's client.
    pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

    /// Read timeout for blob downloads.
    pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

    /// Retries for transient storage transport errors.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// TTL for presigned S3 download URLs.
    pub const PRESIGNED_URL_TTL_SECS: u64 = 3600;
}

/// MQTT connection defaults.
pub mod mqtt {
    use super::*;

    /// Keep-alive interval for the broker connection.
    pub const KEEP_ALIVE: Duration = Duration::from_secs(30);

    /// Default client id prefix when none is configured.
    pub const DEFAULT_CLIENT_ID_PREFIX: &str = "podcleaner";
}

/// Persisted dedup-state file names, matching spec.md §6's layout exactly.
pub mod dedup_files {
    pub const DOWNLOADER_PROCESSED_FILES: &str = "downloader_processed_files.json";
    pub const DOWNLOADER_PROCESSED_RSS: &str = "downloader_processed_rss.json";
    pub const TRANSCRIBER_PROCESSED_FILES: &str = "transcriber_processed_files.json";
    pub const AD_DETECTOR_PROCESSED_FILES: &str = "ad_detector_processed_files.json";
}

/// Storage-key conventions.
pub mod storage_keys {
    /// Prefix every downloaded podcast audio blob is stored under.
    pub const PODCAST_PREFIX: &str = "podcasts/";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_timeouts_are_sane_relative_to_each_other() {
        assert!(network::DOWNLOAD_TIMEOUT > network::HTTP_TIMEOUT);
        assert!(network::CONNECT_TIMEOUT < network::HTTP_TIMEOUT);
        assert!(!network::USER_AGENT.is_empty());
        assert!(network::DOWNLOAD_CHUNK_SIZE > 0);
    }

    #[test]
    fn classifier_defaults_match_spec_values() {
        assert_eq!(classifier::DEFAULT_CHUNK_SIZE, 600);
        assert_eq!(classifier::DEFAULT_MAX_ATTEMPTS, 3);
        assert_eq!(classifier::RETRY_BACKOFF, Duration::from_secs(2));
        assert!((classifier::DEFAULT_TEMPERATURE - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn audio_defaults_match_spec_values() {
        assert_eq!(audio::DEFAULT_MIN_DURATION, 5.0);
        assert_eq!(audio::DEFAULT_MAX_GAP, 20.0);
        assert_eq!(audio::COALESCE_GAP_TOLERANCE, 5.0);
    }

    #[test]
    fn dedup_file_names_match_the_documented_layout() {
        assert_eq!(dedup_files::DOWNLOADER_PROCESSED_FILES, "downloader_processed_files.json");
        assert_eq!(dedup_files::AD_DETECTOR_PROCESSED_FILES, "ad_detector_processed_files.json");
    }
}
