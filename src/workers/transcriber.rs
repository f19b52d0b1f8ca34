//! Converts a downloaded audio blob into a timestamped [`Transcript`] via a
//! [`Recognizer`], caching the result by storage key so repeat requests for
//! an already-transcribed file short-circuit.

use std::sync::Arc;

use serde_json::{json, Map};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::blobstore::BoxedBlobStore;
use crate::bus::{Message, MessageBus, Topics};
use crate::dedup::DedupSet;
use crate::model::Transcript;
use crate::recognizer::Recognizer;

pub struct TranscriberWorker {
    recognizer: Box<dyn Recognizer>,
    blobstore: BoxedBlobStore,
    dedup: DedupSet,
    bus: Arc<dyn MessageBus>,
}

impl TranscriberWorker {
    pub fn new(
        recognizer: Box<dyn Recognizer>,
        blobstore: BoxedBlobStore,
        dedup: DedupSet,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self { recognizer, blobstore, dedup, bus }
    }

    fn transcript_key(file_path: &str) -> String {
        format!("{file_path}.transcript.json")
    }

    pub async fn spawn(self: Arc<Self>, bus: Arc<dyn MessageBus>) -> Result<(), crate::bus::BusError> {
        let worker = self.clone();
        bus.subscribe(
            Topics::TRANSCRIBE_REQUEST,
            Arc::new(move |msg: Message| {
                let worker = worker.clone();
                Box::pin(async move { worker.handle_transcription_request(msg).await })
            }),
        )
        .await
    }

    async fn handle_transcription_request(&self, message: Message) {
        let correlation_id = message.correlation_id;
        let Some(file_path) = message.get_str("file_path").map(str::to_string) else {
            warn!(message_id = %message.message_id, "invalid transcription request: missing file_path");
            self.publish_failed(correlation_id, "No file path provided", None).await;
            return;
        };

        let transcript_key = Self::transcript_key(&file_path);

        if self.dedup.is_processed(&file_path).await {
            info!(%file_path, "file already transcribed");
            self.publish_complete(&file_path, &transcript_key, true, correlation_id).await;
            return;
        }

        if !self.dedup.begin(&file_path).await {
            warn!(%file_path, "file already being transcribed");
            self.publish_failed(correlation_id, "File is already being processed", Some(&file_path))
                .await;
            return;
        }

        match self.transcribe(&file_path, &transcript_key).await {
            Ok(()) => {
                if let Err(err) = self.dedup.complete(&file_path).await {
                    error!(%file_path, error = %err, "failed to persist dedup state");
                }
                self.publish_complete(&file_path, &transcript_key, false, correlation_id).await;
            }
            Err(err) => {
                self.dedup.release(&file_path).await;
                error!(%file_path, error = %err, "transcription failed");
                self.publish_failed(correlation_id, &err.to_string(), Some(&file_path)).await;
            }
        }
    }

    async fn transcribe(&self, file_path: &str, transcript_key: &str) -> anyhow::Result<()> {
        info!(%file_path, "transcribing audio");
        let audio = self.blobstore.get(file_path).await?;

        let temp_dir = std::env::temp_dir();
        let temp_path = temp_dir.join(format!("podcleaner-{}", Uuid::new_v4()));
        tokio::fs::write(&temp_path, &audio).await?;
        let segments = self.recognizer.transcribe(&temp_path).await;
        let _ = tokio::fs::remove_file(&temp_path).await;
        let segments = segments?;

        let transcript = Transcript::new(segments);
        let json = serde_json::to_vec_pretty(&transcript)?;
        self.blobstore.put(transcript_key, bytes::Bytes::from(json)).await?;

        info!(%file_path, segment_count = transcript.segments.len(), "transcription complete");
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
            .publish(Message::new(Topics::TRANSCRIBE_COMPLETE, data, correlation_id.unwrap_or_else(Uuid::new_v4)))
            .await
        {
            error!(error = %err, "failed to publish transcribe.complete");
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
            .publish(Message::new(Topics::TRANSCRIBE_FAILED, data, correlation_id.unwrap_or_else(Uuid::new_v4)))
            .await
        {
            error!(error = %err, "failed to publish transcribe.failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_key_appends_the_conventional_suffix() {
        assert_eq!(TranscriberWorker::transcript_key("abc123"), "abc123.transcript.json");
    }
}
