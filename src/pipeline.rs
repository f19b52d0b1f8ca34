//! Composition root: wires a [`Config`] into a concrete message bus, blob
//! store, and worker set. Shared by both CLI surfaces — `service`, which
//! spawns long-running workers on the chosen bus, and `process`, which the
//! [`crate::orchestrator`] drives through one ad hoc pipeline run — so
//! neither has to duplicate how a `Classifier`/`Recognizer`/`AudioEditor` and
//! their backing stores get built from configuration.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::audio_codec::{AudioEditor, SymphoniaAudioEditor};
use crate::blobstore::{BlobStore, BoxedBlobStore, LocalBlobStore, S3BlobStore};
use crate::bus::{InMemoryMessageBus, MessageBus, MqttMessageBus};
use crate::bus::mqtt::MqttConnectionOptions;
use crate::classifier::{Classifier, OpenAiClassifier};
use crate::config::{Config, MessageBrokerKind, ObjectStorageConfig, ObjectStorageProvider};
use crate::constants::dedup_files;
use crate::dedup::DedupSet;
use crate::recognizer::{CommandRecognizer, Recognizer};
use crate::workers::{AdDetectorWorker, AudioProcessorWorker, DownloaderWorker, TranscriberWorker};

/// A single blob store instance, boxed for the workers that own one
/// exclusively (they never need to share it with anything else).
pub async fn build_blobstore(config: &ObjectStorageConfig) -> Result<BoxedBlobStore> {
    match config.provider {
        ObjectStorageProvider::Local => Ok(Box::new(LocalBlobStore::new(&config.local_storage_path))),
        ObjectStorageProvider::S3 | ObjectStorageProvider::Minio => {
            let store = S3BlobStore::new(config.bucket_name.clone(), config.endpoint_url.clone())
                .await
                .context("failed to initialize S3-compatible blob store")?;
            Ok(Box::new(store))
        }
    }
}

/// Build the message bus selected by `config.message_broker`. Does not call
/// `start()` — callers decide when delivery begins, after every worker has
/// finished subscribing.
pub fn build_bus(config: &Config) -> Arc<dyn MessageBus> {
    match config.message_broker.kind {
        MessageBrokerKind::InMemory => Arc::new(InMemoryMessageBus::new()),
        MessageBrokerKind::Mqtt => {
            let mqtt = &config.message_broker.mqtt;
            Arc::new(MqttMessageBus::new(MqttConnectionOptions {
                host: mqtt.host.clone(),
                port: mqtt.port,
                client_id: mqtt
                    .client_id
                    .clone()
                    .unwrap_or_else(|| format!("{}-{}", crate::constants::mqtt::DEFAULT_CLIENT_ID_PREFIX, uuid::Uuid::new_v4())),
                username: mqtt.username.clone(),
                password: mqtt.password.clone(),
            }))
        }
    }
}

fn build_recognizer(config: &Config) -> Box<dyn Recognizer> {
    Box::new(CommandRecognizer::new(config.recognizer.command.clone(), config.recognizer.args.clone()))
}

fn build_classifier(config: &Config) -> Box<dyn Classifier> {
    Box::new(OpenAiClassifier::new(
        config.llm.base_url.clone().unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        config.llm.api_key.clone(),
        config.llm.model_name.clone(),
        config.llm.temperature,
    ))
}

fn build_audio_editor() -> Box<dyn AudioEditor> {
    Box::new(SymphoniaAudioEditor::new())
}

async fn dedup_set(name: &str) -> Result<DedupSet> {
    let path = Config::state_dir()?.join(name);
    DedupSet::load(path).await.context("failed to load dedup state")
}

/// Which workers a `service` invocation should spawn; `All` is the
/// single-process orchestrator mode, the rest are microservice mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSelection {
    Downloader,
    Transcriber,
    AdDetector,
    AudioProcessor,
    All,
}

/// Construct the selected workers and subscribe them to `bus`. Returns the
/// shared blob store handle so callers (the HTTP front-end, the
/// orchestrator) can read back finished blobs through the same abstraction.
pub async fn spawn_workers(config: &Config, bus: Arc<dyn MessageBus>, selection: WorkerSelection) -> Result<Arc<dyn BlobStore>> {
    let shared_blobstore: Arc<dyn BlobStore> = Arc::from(build_blobstore(&config.object_storage).await?);

    let spawn_downloader = matches!(selection, WorkerSelection::Downloader | WorkerSelection::All);
    let spawn_transcriber = matches!(selection, WorkerSelection::Transcriber | WorkerSelection::All);
    let spawn_ad_detector = matches!(selection, WorkerSelection::AdDetector | WorkerSelection::All);
    let spawn_audio_processor = matches!(selection, WorkerSelection::AudioProcessor | WorkerSelection::All);

    if spawn_downloader {
        let blobstore = build_blobstore(&config.object_storage).await?;
        let dedup = dedup_set(dedup_files::DOWNLOADER_PROCESSED_FILES).await?;
        let rss_dedup = dedup_set(dedup_files::DOWNLOADER_PROCESSED_RSS).await?;
        let worker = Arc::new(DownloaderWorker::new(blobstore, dedup, rss_dedup, bus.clone()));
        worker.spawn(bus.clone()).await.context("failed to subscribe downloader worker")?;
    }

    if spawn_transcriber {
        let blobstore = build_blobstore(&config.object_storage).await?;
        let dedup = dedup_set(dedup_files::TRANSCRIBER_PROCESSED_FILES).await?;
        let recognizer = build_recognizer(config);
        let worker = Arc::new(TranscriberWorker::new(recognizer, blobstore, dedup, bus.clone()));
        worker.spawn(bus.clone()).await.context("failed to subscribe transcriber worker")?;
    }

    if spawn_ad_detector {
        let blobstore = build_blobstore(&config.object_storage).await?;
        let dedup = dedup_set(dedup_files::AD_DETECTOR_PROCESSED_FILES).await?;
        let classifier = build_classifier(config);
        let worker = Arc::new(AdDetectorWorker::new(
            classifier,
            blobstore,
            dedup,
            bus.clone(),
            config.ad_phrases.clone(),
            config.llm.chunk_size,
            config.llm.max_attempts,
        ));
        worker.spawn(bus.clone()).await.context("failed to subscribe ad detector worker")?;
    }

    if spawn_audio_processor {
        let blobstore = build_blobstore(&config.object_storage).await?;
        let editor = build_audio_editor();
        let worker = Arc::new(AudioProcessorWorker::new(editor, blobstore, bus.clone(), config.audio.max_gap, config.audio.min_duration));
        worker.spawn(bus.clone()).await.context("failed to subscribe audio processor worker")?;
    }

    Ok(shared_blobstore)
}
