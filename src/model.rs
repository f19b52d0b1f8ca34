//! Core domain types shared across workers: transcript segments, chunks,
//! per-chunk classifier results, and the RSS-facing podcast/episode shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One atomic unit of a transcript.
///
/// `id` is dense and 0-based within its owning `Transcript`; segments are kept
/// in ascending `start` order, matching insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: u32,
    pub text: String,
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub is_ad: bool,
}

impl Segment {
    pub fn new(id: u32, text: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            id,
            text: text.into(),
            start,
            end,
            is_ad: false,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Ordered sequence of segments plus the time the recognizer finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub segments: Vec<Segment>,
    pub processed_at: DateTime<Utc>,
}

impl Transcript {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self {
            segments,
            processed_at: Utc::now(),
        }
    }

    pub fn ad_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| s.is_ad)
    }

    pub fn non_ad_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| !s.is_ad)
    }
}

/// A contiguous slice of segments submitted to the Classifier as one LLM call.
#[derive(Debug, Clone)]
pub struct TranscriptChunk {
    pub chunk_id: u32,
    pub segments: Vec<Segment>,
}

/// Per-chunk Classifier outcome: the (possibly mutated) segments, plus an
/// error string if the chunk exhausted its retry budget.
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub segments: Vec<Segment>,
    pub error: Option<String>,
}

/// One RSS-sourced episode, with the fields the Downloader's RSS handling
/// extracts and the `/rss` endpoint rewrites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeInfo {
    pub title: String,
    pub description: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub audio_url: String,
    pub original_url: Option<String>,
}

/// Cached metadata for a parsed RSS feed, keyed by feed URL in the HTTP
/// component's `cached_podcast_info` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodcastInfo {
    pub title: String,
    pub description: Option<String>,
    pub link: Option<String>,
    pub episodes: Vec<EpisodeInfo>,
}
