//! End-to-end exercises of the four pipeline workers wired together over an
//! in-process bus, mirroring how `orchestrator.rs` chains them in
//! production but with fake `Recognizer`/`Classifier`/`AudioEditor`
//! collaborators standing in for whisper/an LLM/symphonia.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use podcleaner::audio_codec::{AudioEditor, AudioEditorError};
use podcleaner::blobstore::{BlobStore, LocalBlobStore};
use podcleaner::bus::{InMemoryMessageBus, Message, MessageBus, Topics};
use podcleaner::classifier::{ChunkVerdicts, Classifier, ClassifierError};
use podcleaner::dedup::DedupSet;
use podcleaner::model::Segment;
use podcleaner::recognizer::{Recognizer, RecognizerError};
use podcleaner::workers::{AdDetectorWorker, AudioProcessorWorker, DownloaderWorker, TranscriberWorker};
use serde_json::{json, Map};
use tempfile::TempDir;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Returns the literal fixture `classifier::merge_adjacent_ads` is tested
/// against: 12 contiguous segments, ids 147-158.
fn fixture_segments() -> Vec<Segment> {
    (147..159)
        .map(|id| {
            let text = if id == 148 || id == 149 {
                "Wir sind nach einer kurzen Unterbrechung wieder da".to_string()
            } else {
                format!("segment {id}")
            };
            Segment::new(id, text, id as f64, id as f64 + 1.0)
        })
        .collect()
}

struct FakeRecognizer {
    segments: Vec<Segment>,
}

#[async_trait]
impl Recognizer for FakeRecognizer {
    async fn transcribe(&self, _audio_path: &Path) -> Result<Vec<Segment>, RecognizerError> {
        Ok(self.segments.clone())
    }
}

/// Marks segments 154-157 as ads, matching what the LLM found in the
/// reference fixture before the coalescing sweep pulls 148-149 in too.
struct FixtureClassifier;

#[async_trait]
impl Classifier for FixtureClassifier {
    async fn classify_chunk(&self, chunk: &podcleaner::model::TranscriptChunk) -> Result<ChunkVerdicts, ClassifierError> {
        let mut verdicts = ChunkVerdicts::new();
        for segment in &chunk.segments {
            verdicts.insert(segment.id, (154..=157).contains(&segment.id));
        }
        Ok(verdicts)
    }
}

/// Stands in for `SymphoniaAudioEditor`: just copies bytes through, since
/// these tests assert on pipeline wiring, not actual waveform surgery.
struct PassthroughAudioEditor;

#[async_trait]
impl AudioEditor for PassthroughAudioEditor {
    async fn remove_segments(&self, input_path: &Path, output_path: &Path, _cuts: &[(f64, f64)]) -> Result<(), AudioEditorError> {
        tokio::fs::copy(input_path, output_path)
            .await
            .map_err(|source| AudioEditorError::Write { path: output_path.display().to_string(), source: source.into() })?;
        Ok(())
    }
}

struct Harness {
    bus: Arc<dyn MessageBus>,
    blobstore: Arc<LocalBlobStore>,
    pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<String, String>>>>>,
    _state_dir: TempDir,
    _blob_dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let blob_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        let blobstore = Arc::new(LocalBlobStore::new(blob_dir.path().to_path_buf()));
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryMessageBus::new());

        let downloader = Arc::new(DownloaderWorker::new(
            Box::new(LocalBlobStore::new(blob_dir.path().to_path_buf())),
            DedupSet::load(state_dir.path().join("downloader.json")).await.unwrap(),
            DedupSet::load(state_dir.path().join("downloader_rss.json")).await.unwrap(),
            bus.clone(),
        ));
        downloader.clone().spawn(bus.clone()).await.unwrap();

        let transcriber = Arc::new(TranscriberWorker::new(
            Box::new(FakeRecognizer { segments: fixture_segments() }),
            Box::new(LocalBlobStore::new(blob_dir.path().to_path_buf())),
            DedupSet::load(state_dir.path().join("transcriber.json")).await.unwrap(),
            bus.clone(),
        ));
        transcriber.clone().spawn(bus.clone()).await.unwrap();

        let ad_detector = Arc::new(AdDetectorWorker::new(
            Box::new(FixtureClassifier),
            Box::new(LocalBlobStore::new(blob_dir.path().to_path_buf())),
            DedupSet::load(state_dir.path().join("ad_detector.json")).await.unwrap(),
            bus.clone(),
            Default::default(),
            600,
            3,
        ));
        ad_detector.clone().spawn(bus.clone()).await.unwrap();

        let audio_processor = Arc::new(AudioProcessorWorker::new(
            Box::new(PassthroughAudioEditor),
            Box::new(LocalBlobStore::new(blob_dir.path().to_path_buf())),
            bus.clone(),
            20.0,
            5.0,
        ));
        audio_processor.clone().spawn(bus.clone()).await.unwrap();

        let pending = Arc::new(Mutex::new(HashMap::new()));
        register_chain(bus.clone(), pending.clone()).await;

        bus.start().await.unwrap();

        Self { bus, blobstore, pending, _state_dir: state_dir, _blob_dir: blob_dir }
    }

    /// Submits `url` and waits for the terminal message (success with the
    /// output blob key, or failure with the error text) for that run.
    async fn run(&self, url: &str) -> Result<String, String> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        let mut data = Map::new();
        data.insert("url".into(), json!(url));
        self.bus.publish(Message::new(Topics::DOWNLOAD_REQUEST, data, request_id)).await.unwrap();

        rx.await.expect("pipeline run was dropped before completing")
    }
}

/// Chains DOWNLOAD_COMPLETE -> TRANSCRIBE_REQUEST -> AD_DETECTION_REQUEST ->
/// AUDIO_PROCESSING_REQUEST and resolves each run's oneshot on its first
/// terminal (`_COMPLETE`/`_FAILED`) message, the same shape as
/// `orchestrator::register_handlers` but scoped to this test file.
async fn register_chain(bus: Arc<dyn MessageBus>, pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<String, String>>>>>) {
    subscribe(&bus, Topics::DOWNLOAD_COMPLETE, {
        let bus = bus.clone();
        move |msg: Message| {
            let bus = bus.clone();
            async move {
                let file_path = msg.get_str("file_path").unwrap().to_string();
                let mut data = Map::new();
                data.insert("file_path".into(), json!(file_path));
                bus.publish(Message::new(Topics::TRANSCRIBE_REQUEST, data, msg.correlation_id.unwrap())).await.unwrap();
            }
        }
    })
    .await;

    subscribe(&bus, Topics::DOWNLOAD_FAILED, {
        let pending = pending.clone();
        move |msg: Message| {
            let pending = pending.clone();
            async move {
                let error = msg.get_str("error").unwrap_or("download failed").to_string();
                resolve(&pending, msg.correlation_id.unwrap(), Err(error)).await;
            }
        }
    })
    .await;

    subscribe(&bus, Topics::TRANSCRIBE_COMPLETE, {
        let bus = bus.clone();
        move |msg: Message| {
            let bus = bus.clone();
            async move {
                let file_path = msg.get_str("file_path").unwrap().to_string();
                let transcript_path = msg.get_str("transcript_path").unwrap().to_string();
                let mut data = Map::new();
                data.insert("file_path".into(), json!(file_path));
                data.insert("transcript_path".into(), json!(transcript_path));
                bus.publish(Message::new(Topics::AD_DETECTION_REQUEST, data, msg.correlation_id.unwrap())).await.unwrap();
            }
        }
    })
    .await;

    subscribe(&bus, Topics::TRANSCRIBE_FAILED, {
        let pending = pending.clone();
        move |msg: Message| {
            let pending = pending.clone();
            async move {
                let error = msg.get_str("error").unwrap_or("transcription failed").to_string();
                resolve(&pending, msg.correlation_id.unwrap(), Err(error)).await;
            }
        }
    })
    .await;

    subscribe(&bus, Topics::AD_DETECTION_COMPLETE, {
        let bus = bus.clone();
        move |msg: Message| {
            let bus = bus.clone();
            async move {
                let file_path = msg.get_str("file_path").unwrap().to_string();
                let transcript_path = msg.get_str("transcript_path").unwrap().to_string();
                let mut data = Map::new();
                data.insert("file_path".into(), json!(file_path));
                data.insert("transcript_path".into(), json!(transcript_path));
                bus.publish(Message::new(Topics::AUDIO_PROCESSING_REQUEST, data, msg.correlation_id.unwrap())).await.unwrap();
            }
        }
    })
    .await;

    subscribe(&bus, Topics::AD_DETECTION_FAILED, {
        let pending = pending.clone();
        move |msg: Message| {
            let pending = pending.clone();
            async move {
                let error = msg.get_str("error").unwrap_or("ad detection failed").to_string();
                resolve(&pending, msg.correlation_id.unwrap(), Err(error)).await;
            }
        }
    })
    .await;

    subscribe(&bus, Topics::AUDIO_PROCESSING_COMPLETE, {
        let pending = pending.clone();
        move |msg: Message| {
            let pending = pending.clone();
            async move {
                let output_path = msg.get_str("output_path").unwrap().to_string();
                resolve(&pending, msg.correlation_id.unwrap(), Ok(output_path)).await;
            }
        }
    })
    .await;

    subscribe(&bus, Topics::AUDIO_PROCESSING_FAILED, {
        let pending = pending.clone();
        move |msg: Message| {
            let pending = pending.clone();
            async move {
                let error = msg.get_str("error").unwrap_or("audio processing failed").to_string();
                resolve(&pending, msg.correlation_id.unwrap(), Err(error)).await;
            }
        }
    })
    .await;
}

async fn resolve(pending: &Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<String, String>>>>>, request_id: Uuid, outcome: Result<String, String>) {
    if let Some(tx) = pending.lock().await.remove(&request_id) {
        let _ = tx.send(outcome);
    }
}

async fn subscribe<F, Fut>(bus: &Arc<dyn MessageBus>, topic: &str, handler: F)
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let handler = Arc::new(handler);
    bus.subscribe(
        topic,
        Arc::new(move |msg: Message| {
            let handler = handler.clone();
            Box::pin(async move { handler(msg).await })
        }),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn full_pipeline_run_removes_the_fixture_ad_block() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/episode.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"AUDIODATA".to_vec()))
        .mount(&server)
        .await;

    let harness = Harness::new().await;
    let url = format!("{}/episode.mp3", server.uri());

    let output_key = harness.run(&url).await.expect("pipeline should succeed");

    // Ads were found (the fixture always yields ids 148,149,154-157), so the
    // audio processor must have rendered a distinct `_clean` output key.
    assert!(output_key.contains("_clean"));
    assert!(harness.blobstore.get(&output_key).await.is_ok());
}

#[tokio::test]
async fn download_failure_short_circuits_before_transcription() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.mp3"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let harness = Harness::new().await;
    let url = format!("{}/missing.mp3", server.uri());

    let result = harness.run(&url).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn resubmitting_the_same_url_does_not_redownload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/episode.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"AUDIODATA".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new().await;
    let url = format!("{}/episode.mp3", server.uri());

    let first = harness.run(&url).await.expect("first run should succeed");
    let second = harness.run(&url).await.expect("second run should succeed");

    assert_eq!(first, second);
}

#[tokio::test]
async fn three_concurrent_distinct_urls_all_reach_completion() {
    let server = MockServer::start().await;
    for name in ["a", "b", "c"] {
        Mock::given(method("GET"))
            .and(path(format!("/{name}.mp3")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"AUDIODATA".to_vec()))
            .mount(&server)
            .await;
    }

    let harness = Harness::new().await;
    let urls = ["a", "b", "c"].map(|name| format!("{}/{name}.mp3", server.uri()));

    let (r1, r2, r3) = tokio::join!(harness.run(&urls[0]), harness.run(&urls[1]), harness.run(&urls[2]));

    assert!(r1.is_ok());
    assert!(r2.is_ok());
    assert!(r3.is_ok());
}
