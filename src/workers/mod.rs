//! Pipeline workers: each subscribes to a `_REQUEST` topic, does its
//! (potentially opaque-collaborator-backed) work, and publishes exactly one
//! `_COMPLETE` or `_FAILED` message per request, preserving the inbound
//! correlation id. Every handler is built to be idempotent under
//! at-least-once delivery via a [`crate::dedup::DedupSet`].

pub mod ad_detector;
pub mod audio_processor;
pub mod downloader;
pub mod transcriber;

pub use ad_detector::AdDetectorWorker;
pub use audio_processor::AudioProcessorWorker;
pub use downloader::DownloaderWorker;
pub use transcriber::TranscriberWorker;
