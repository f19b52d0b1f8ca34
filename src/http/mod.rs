//! Stateful HTTP front-end. Each client request either short-circuits against
//! a cached result or kicks off the pipeline by publishing the first stage's
//! request message; every later stage is driven by bus subscriptions that
//! mutate the request's `RequestState`, never by polling a worker directly.

pub mod request_state;
pub mod rss;

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::blobstore::BlobStore;
use crate::bus::{BusError, Message, MessageBus, Topics};
use crate::model::PodcastInfo;
use crate::workers::downloader::fetch_podcast_info;

pub use request_state::{RequestState, RequestStatus, RequestType, StepState};

/// Shared state behind every route and bus handler. Each map is guarded
/// independently so unrelated requests never contend on the same lock.
pub struct AppState {
    pub bus: Arc<dyn MessageBus>,
    pub blobstore: Arc<dyn BlobStore>,
    pub http_client: reqwest::Client,
    /// This server's own externally reachable base URL, used to rewrite RSS
    /// enclosures to `{base_url}/process?url=...`.
    pub base_url: String,
    requests: RwLock<HashMap<Uuid, RequestState>>,
    /// Maps a synthetic `file_id` (minted once audio processing completes) to
    /// the blob key clients download via `/download/:file_id`.
    file_mappings: RwLock<HashMap<Uuid, String>>,
    /// Maps the original source URL to its finished `file_id`, so a repeat
    /// `/process?url=` for the same episode can stream the cached result
    /// instead of re-running the whole pipeline.
    url_to_file: RwLock<HashMap<String, Uuid>>,
    cached_podcasts: RwLock<HashMap<String, PodcastInfo>>,
}

impl AppState {
    pub fn new(bus: Arc<dyn MessageBus>, blobstore: Arc<dyn BlobStore>, base_url: impl Into<String>) -> Self {
        Self {
            bus,
            blobstore,
            http_client: reqwest::Client::builder()
                .timeout(crate::constants::network::HTTP_TIMEOUT)
                .connect_timeout(crate::constants::network::CONNECT_TIMEOUT)
                .user_agent(crate::constants::network::USER_AGENT)
                .build()
                .expect("reqwest client configuration should always be valid"),
            base_url: base_url.into(),
            requests: RwLock::new(HashMap::new()),
            file_mappings: RwLock::new(HashMap::new()),
            url_to_file: RwLock::new(HashMap::new()),
            cached_podcasts: RwLock::new(HashMap::new()),
        }
    }

    async fn push_step(&self, request_id: Uuid, step: StepState) {
        let mut requests = self.requests.write().await;
        if let Some(state) = requests.get_mut(&request_id) {
            state.push_step(step);
        } else {
            warn!(%request_id, "step update for unknown request id, ignoring");
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/process", get(process_handler))
        .route("/rss", get(rss_handler))
        .route("/status", get(status_handler))
        .route("/download/:file_id", get(download_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Subscribe every bus handler that drives the request FSM forward. Must run
/// before `bus.start()` so no completion is missed.
pub async fn register_handlers(state: Arc<AppState>) -> Result<(), BusError> {
    subscribe(&state, Topics::DOWNLOAD_COMPLETE, on_download_complete).await?;
    subscribe(&state, Topics::DOWNLOAD_FAILED, on_download_failed).await?;
    subscribe(&state, Topics::TRANSCRIBE_COMPLETE, on_transcribe_complete).await?;
    subscribe(&state, Topics::TRANSCRIBE_FAILED, on_transcribe_failed).await?;
    subscribe(&state, Topics::AD_DETECTION_COMPLETE, on_ad_detection_complete).await?;
    subscribe(&state, Topics::AD_DETECTION_FAILED, on_ad_detection_failed).await?;
    subscribe(&state, Topics::AD_DETECTION_IN_PROGRESS, on_ad_detection_in_progress).await?;
    subscribe(&state, Topics::AUDIO_PROCESSING_COMPLETE, on_audio_processing_complete).await?;
    subscribe(&state, Topics::AUDIO_PROCESSING_FAILED, on_audio_processing_failed).await?;
    Ok(())
}

async fn subscribe<F, Fut>(state: &Arc<AppState>, topic: &str, handler: F) -> Result<(), BusError>
where
    F: Fn(Arc<AppState>, Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let state = state.clone();
    state
        .bus
        .subscribe(
            topic,
            Arc::new(move |msg: Message| {
                let state = state.clone();
                Box::pin(handler(state, msg))
            }),
        )
        .await
}

fn required_id(message: &Message) -> Option<Uuid> {
    let id = message.correlation_id;
    if id.is_none() {
        warn!(message_id = %message.message_id, "bus message missing correlation id, cannot route to a request");
    }
    id
}

async fn on_download_complete(state: Arc<AppState>, message: Message) {
    let Some(request_id) = required_id(&message) else { return };
    let Some(file_path) = message.get_str("file_path").map(str::to_string) else { return };

    state.push_step(request_id, StepState::ok("download")).await;

    let mut data = Map::new();
    data.insert("file_path".into(), json!(file_path));
    if let Err(err) = state.bus.publish(Message::new(Topics::TRANSCRIBE_REQUEST, data, request_id)).await {
        error!(%request_id, error = %err, "failed to publish transcribe.request");
    }
}

async fn on_download_failed(state: Arc<AppState>, message: Message) {
    let Some(request_id) = required_id(&message) else { return };
    let error_text = message.get_str("error").unwrap_or("download failed").to_string();
    state.push_step(request_id, StepState::failed("download", error_text)).await;
}

async fn on_transcribe_complete(state: Arc<AppState>, message: Message) {
    let Some(request_id) = required_id(&message) else { return };
    let Some(file_path) = message.get_str("file_path").map(str::to_string) else { return };
    let Some(transcript_path) = message.get_str("transcript_path").map(str::to_string) else { return };

    state.push_step(request_id, StepState::ok("transcription")).await;

    let mut data = Map::new();
    data.insert("file_path".into(), json!(file_path));
    data.insert("transcript_path".into(), json!(transcript_path));
    if let Err(err) = state.bus.publish(Message::new(Topics::AD_DETECTION_REQUEST, data, request_id)).await {
        error!(%request_id, error = %err, "failed to publish ad_detection.request");
    }
}

async fn on_transcribe_failed(state: Arc<AppState>, message: Message) {
    let Some(request_id) = required_id(&message) else { return };
    let error_text = message.get_str("error").unwrap_or("transcription failed").to_string();
    state.push_step(request_id, StepState::failed("transcription", error_text)).await;
}

async fn on_ad_detection_complete(state: Arc<AppState>, message: Message) {
    let Some(request_id) = required_id(&message) else { return };
    let Some(file_path) = message.get_str("file_path").map(str::to_string) else { return };
    let Some(transcript_path) = message.get_str("transcript_path").map(str::to_string) else { return };

    state.push_step(request_id, StepState::ok("ad_detection")).await;

    let mut data = Map::new();
    data.insert("file_path".into(), json!(file_path));
    data.insert("transcript_path".into(), json!(transcript_path));
    if let Err(err) = state.bus.publish(Message::new(Topics::AUDIO_PROCESSING_REQUEST, data, request_id)).await {
        error!(%request_id, error = %err, "failed to publish audio_processing.request");
    }
}

async fn on_ad_detection_failed(state: Arc<AppState>, message: Message) {
    let Some(request_id) = required_id(&message) else { return };
    let error_text = message.get_str("error").unwrap_or("ad detection failed").to_string();
    state.push_step(request_id, StepState::failed("ad_detection", error_text)).await;
}

/// A chunk exhausted its retry budget and was left unmarked rather than
/// failing the whole request; recorded as an `in_progress` step so `/status`
/// reflects the degraded result without flipping the request to failed.
async fn on_ad_detection_in_progress(state: Arc<AppState>, message: Message) {
    let Some(request_id) = required_id(&message) else { return };
    info!(%request_id, "ad detection reported partial progress");
    state.push_step(request_id, StepState::in_progress("ad_detection")).await;
}

async fn on_audio_processing_complete(state: Arc<AppState>, message: Message) {
    let Some(request_id) = required_id(&message) else { return };
    let Some(output_path) = message.get_str("output_path").map(str::to_string) else { return };

    let file_id = Uuid::new_v4();

    {
        let mut requests = state.requests.write().await;
        let Some(request_state) = requests.get_mut(&request_id) else {
            warn!(%request_id, "audio_processing.complete for unknown request id, ignoring");
            return;
        };

        state.file_mappings.write().await.insert(file_id, output_path);
        state.url_to_file.write().await.insert(request_state.url.clone(), file_id);

        request_state.push_step(StepState::ok("audio_processing").with_download_url(format!("/download/{file_id}")));
        request_state.mark_completed();
    }

    info!(%request_id, %file_id, "pipeline completed");
}

async fn on_audio_processing_failed(state: Arc<AppState>, message: Message) {
    let Some(request_id) = required_id(&message) else { return };
    let error_text = message.get_str("error").unwrap_or("audio processing failed").to_string();
    state.push_step(request_id, StepState::failed("audio_processing", error_text)).await;
}

#[derive(Debug, Deserialize)]
struct ProcessQuery {
    url: String,
}

async fn process_handler(State(state): State<Arc<AppState>>, Query(query): Query<ProcessQuery>) -> Response {
    let url = query.url;

    if let Some(file_id) = state.url_to_file.read().await.get(&url).copied() {
        let key = state.file_mappings.read().await.get(&file_id).cloned();
        if let Some(key) = key {
            info!(%url, %file_id, "serving cached result for already-processed url");
            return stream_blob(&state, &key, &format!("podcast_{file_id}.mp3")).await;
        }
    }

    let request_id = Uuid::new_v4();
    state
        .requests
        .write()
        .await
        .insert(request_id, RequestState::new(request_id, RequestType::Process, &url));

    let mut data = Map::new();
    data.insert("url".into(), json!(url));
    match state.bus.publish(Message::new(Topics::DOWNLOAD_REQUEST, data, request_id)).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            format!("Processing started. Check status at /status?id={request_id}"),
        )
            .into_response(),
        Err(err) => {
            error!(%request_id, error = %err, "failed to publish download.request");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to start processing").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct RssQuery {
    url: String,
}

async fn rss_handler(State(state): State<Arc<AppState>>, Query(query): Query<RssQuery>) -> Response {
    let url = query.url;

    if let Some(cached) = state.cached_podcasts.read().await.get(&url).cloned() {
        return rss_response(&cached);
    }

    match fetch_podcast_info(&state.http_client, &url, Some(&state.base_url)).await {
        Ok(podcast_info) => {
            state.cached_podcasts.write().await.insert(url, podcast_info.clone());
            rss_response(&podcast_info)
        }
        Err(err) => {
            error!(url = %url, error = %err, "failed to fetch rss feed");
            (StatusCode::BAD_GATEWAY, format!("failed to fetch rss feed: {err}")).into_response()
        }
    }
}

fn rss_response(podcast: &PodcastInfo) -> Response {
    let xml = rss::render(podcast);
    (StatusCode::OK, [(header::CONTENT_TYPE, "application/rss+xml; charset=utf-8")], xml).into_response()
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    id: Uuid,
}

async fn status_handler(State(state): State<Arc<AppState>>, Query(query): Query<StatusQuery>) -> Response {
    match state.requests.read().await.get(&query.id) {
        Some(request_state) => Json(request_state).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown request id").into_response(),
    }
}

async fn download_handler(State(state): State<Arc<AppState>>, Path(file_id): Path<Uuid>) -> Response {
    let key = state.file_mappings.read().await.get(&file_id).cloned();
    match key {
        Some(key) => stream_blob(&state, &key, &format!("podcast_{file_id}.mp3")).await,
        None => (StatusCode::NOT_FOUND, "unknown file id").into_response(),
    }
}

async fn stream_blob(state: &Arc<AppState>, key: &str, filename: &str) -> Response {
    match state.blobstore.get(key).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type_for(key).to_string()),
                (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\"")),
            ],
            Body::from(bytes),
        )
            .into_response(),
        Err(err) => {
            error!(%key, error = %err, "failed to read blob for download");
            (StatusCode::NOT_FOUND, "file not found").into_response()
        }
    }
}

fn content_type_for(key: &str) -> &'static str {
    if key.ends_with(".mp3") {
        "audio/mpeg"
    } else if key.ends_with(".wav") {
        "audio/wav"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryMessageBus;
    use crate::blobstore::LocalBlobStore;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn test_state() -> Arc<AppState> {
        let dir = TempDir::new().unwrap();
        Arc::new(AppState::new(
            Arc::new(InMemoryMessageBus::new()),
            Arc::new(LocalBlobStore::new(dir.path())),
            "http://localhost:8080",
        ))
    }

    #[tokio::test]
    async fn download_complete_advances_the_request_and_requests_transcription() {
        let state = test_state();
        state.bus.start().await.unwrap();
        register_handlers(state.clone()).await.unwrap();

        let request_id = Uuid::new_v4();
        state.requests.write().await.insert(
            request_id,
            RequestState::new(request_id, RequestType::Process, "https://example.com/ep.mp3"),
        );

        let mut data = Map::new();
        data.insert("file_path".into(), json!("podcasts/abc"));
        state.bus.publish(Message::new(Topics::DOWNLOAD_COMPLETE, data, request_id)).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let requests = state.requests.read().await;
        let request_state = requests.get(&request_id).unwrap();
        assert_eq!(request_state.steps.len(), 2);
        assert_eq!(request_state.steps[1].name, "download");
        assert_eq!(request_state.status, RequestStatus::Processing);
    }

    #[tokio::test]
    async fn audio_processing_complete_marks_the_request_completed_and_maps_a_file_id() {
        let state = test_state();
        state.bus.start().await.unwrap();
        register_handlers(state.clone()).await.unwrap();

        let request_id = Uuid::new_v4();
        state.requests.write().await.insert(
            request_id,
            RequestState::new(request_id, RequestType::Process, "https://example.com/ep.mp3"),
        );

        let mut data = Map::new();
        data.insert("output_path".into(), json!("podcasts/abc_clean.mp3"));
        state.bus.publish(Message::new(Topics::AUDIO_PROCESSING_COMPLETE, data, request_id)).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let requests = state.requests.read().await;
        let request_state = requests.get(&request_id).unwrap();
        assert_eq!(request_state.status, RequestStatus::Completed);
        assert!(state.url_to_file.read().await.contains_key("https://example.com/ep.mp3"));
    }

    #[tokio::test]
    async fn rss_handler_rewrites_enclosures_to_process_urls_and_caches_the_feed() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let feed = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/">
  <channel>
    <title>Example Show</title>
    <item>
      <title>Episode 1</title>
      <media:content url="https://cdn.example.com/ep1.mp3" type="audio/mpeg"/>
    </item>
    <item>
      <title>Episode 2</title>
      <media:content url="https://cdn.example.com/ep2.mp3" type="audio/mpeg"/>
    </item>
  </channel>
</rss>"#;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(feed))
            .expect(1)
            .mount(&server)
            .await;

        let state = test_state();
        let feed_url = format!("{}/feed.xml", server.uri());

        let response = rss_handler(State(state.clone()), Query(RssQuery { url: feed_url.clone() })).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let xml = String::from_utf8(body.to_vec()).unwrap();

        let expected_count = xml.matches("http://localhost:8080/process?url=https://cdn.example.com/").count();
        assert_eq!(expected_count, 2);

        // Second call hits the cache, not the feed server again.
        let response = rss_handler(State(state.clone()), Query(RssQuery { url: feed_url })).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn process_handler_short_circuits_on_a_cached_url() {
        let state = test_state();
        state.blobstore.put("podcasts/abc", Bytes::from_static(b"audio-bytes")).await.unwrap();
        let file_id = Uuid::new_v4();
        state.file_mappings.write().await.insert(file_id, "podcasts/abc".to_string());
        state.url_to_file.write().await.insert("https://example.com/ep.mp3".to_string(), file_id);

        let response = process_handler(
            State(state.clone()),
            Query(ProcessQuery { url: "https://example.com/ep.mp3".to_string() }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
    }
}
