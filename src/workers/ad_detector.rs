//! Loads a transcript, runs it through the [`Classifier`] pipeline
//! (chunk/classify/merge/coalesce), and writes the ad-annotated transcript
//! back to the same blob key.

use std::sync::Arc;

use serde_json::{json, Map};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::blobstore::BoxedBlobStore;
use crate::bus::{Message, MessageBus, Topics};
use crate::classifier::{self, AdPhraseConfig, Classifier};
use crate::dedup::DedupSet;
use crate::model::Transcript;

pub struct AdDetectorWorker {
    classifier: Box<dyn Classifier>,
    blobstore: BoxedBlobStore,
    dedup: DedupSet,
    bus: Arc<dyn MessageBus>,
    phrases: AdPhraseConfig,
    chunk_size: usize,
    max_attempts: u32,
}

impl AdDetectorWorker {
    pub fn new(
        classifier: Box<dyn Classifier>,
        blobstore: BoxedBlobStore,
        dedup: DedupSet,
        bus: Arc<dyn MessageBus>,
        phrases: AdPhraseConfig,
        chunk_size: usize,
        max_attempts: u32,
    ) -> Self {
        Self { classifier, blobstore, dedup, bus, phrases, chunk_size, max_attempts }
    }

    pub async fn spawn(self: Arc<Self>, bus: Arc<dyn MessageBus>) -> Result<(), crate::bus::BusError> {
        let worker = self.clone();
        bus.subscribe(
            Topics::AD_DETECTION_REQUEST,
            Arc::new(move |msg: Message| {
                let worker = worker.clone();
                Box::pin(async move { worker.handle_ad_detection_request(msg).await })
            }),
        )
        .await
    }

    async fn handle_ad_detection_request(&self, message: Message) {
        let correlation_id = message.correlation_id;
        let (file_path, transcript_path) = match (
            message.get_str("file_path").map(str::to_string),
            message.get_str("transcript_path").map(str::to_string),
        ) {
            (Some(file_path), Some(transcript_path)) => (file_path, transcript_path),
            _ => {
                warn!(message_id = %message.message_id, "invalid ad detection request: missing file_path or transcript_path");
                self.publish_failed(correlation_id, "Missing file_path or transcript_path", None)
                    .await;
                return;
            }
        };

        if self.dedup.is_processed(&file_path).await {
            info!(%file_path, "file already ad-detected");
            self.publish_complete(&file_path, &transcript_path, true, correlation_id).await;
            return;
        }

        if !self.dedup.begin(&file_path).await {
            info!(%file_path, "file already being ad-detected");
            self.publish_in_progress(&file_path, &transcript_path, correlation_id).await;
            return;
        }

        match self.detect(&transcript_path).await {
            Ok(()) => {
                if let Err(err) = self.dedup.complete(&file_path).await {
                    error!(%file_path, error = %err, "failed to persist dedup state");
                }
                self.publish_complete(&file_path, &transcript_path, false, correlation_id).await;
            }
            Err(err) => {
                self.dedup.release(&file_path).await;
                error!(%file_path, error = %err, "ad detection failed");
                self.publish_failed(correlation_id, &err.to_string(), Some(&file_path)).await;
            }
        }
    }

    async fn detect(&self, transcript_path: &str) -> anyhow::Result<()> {
        let raw = self.blobstore.get(transcript_path).await?;
        let transcript: Transcript = serde_json::from_slice(&raw)?;

        let processed = classifier::detect_ads(
            self.classifier.as_ref(),
            &transcript,
            self.chunk_size,
            self.max_attempts,
            &self.phrases,
        )
        .await;

        let encoded = serde_json::to_vec_pretty(&processed)?;
        self.blobstore.put(transcript_path, bytes::Bytes::from(encoded)).await?;
        Ok(())
    }

    async fn publish_complete(&self, file_path: &str, transcript_path: &str, already_processed: bool, correlation_id: Option<Uuid>) {
        let mut data = Map::new();
        data.insert("file_path".into(), json!(file_path));
        data.insert("transcript_path".into(), json!(transcript_path));
        if already_processed {
            data.insert("already_processed".into(), json!(true));
        }

        if let Err(err) = self
            .bus
            .publish(Message::new(Topics::AD_DETECTION_COMPLETE, data, correlation_id.unwrap_or_else(Uuid::new_v4)))
            .await
        {
            error!(error = %err, "failed to publish ad_detection.complete");
        }
    }

    async fn publish_in_progress(&self, file_path: &str, transcript_path: &str, correlation_id: Option<Uuid>) {
        let mut data = Map::new();
        data.insert("file_path".into(), json!(file_path));
        data.insert("transcript_path".into(), json!(transcript_path));

        if let Err(err) = self
            .bus
            .publish(Message::new(
                Topics::AD_DETECTION_IN_PROGRESS,
                data,
                correlation_id.unwrap_or_else(Uuid::new_v4),
            ))
            .await
        {
            error!(error = %err, "failed to publish ad_detection.in_progress");
        }
    }

    async fn publish_failed(&self, correlation_id: Option<Uuid>, error_text: &str, file_path: Option<&str>) {
        let mut data = Map::new();
        data.insert("error".into(), json!(error_text));
        if let Some(file_path) = file_path {
            data.insert("file_path".into(), json!(file_path));
        }

        if let Err(err) = self
            .bus
            .publish(Message::new(Topics::AD_DETECTION_FAILED, data, correlation_id.unwrap_or_else(Uuid::new_v4)))
            .await
        {
            error!(error = %err, "failed to publish ad_detection.failed");
        }
    }
}
