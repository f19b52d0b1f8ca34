//! Loads a transcript's ad segments, merges them into a minimal cut set, and
//! asks an [`AudioEditor`] to render a copy of the audio with those
//! intervals removed, publishing the output's blob key.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Map};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audio_codec::{ad_segment_intervals, merge_cut_segments, AudioEditor};
use crate::blobstore::BoxedBlobStore;
use crate::bus::{Message, MessageBus, Topics};
use crate::model::Transcript;

pub struct AudioProcessorWorker {
    editor: Box<dyn AudioEditor>,
    blobstore: BoxedBlobStore,
    bus: Arc<dyn MessageBus>,
    max_gap: f64,
    min_duration: f64,
}

impl AudioProcessorWorker {
    pub fn new(
        editor: Box<dyn AudioEditor>,
        blobstore: BoxedBlobStore,
        bus: Arc<dyn MessageBus>,
        max_gap: f64,
        min_duration: f64,
    ) -> Self {
        Self { editor, blobstore, bus, max_gap, min_duration }
    }

    fn output_key(file_path: &str) -> String {
        match file_path.rsplit_once('.') {
            Some((base, ext)) => format!("{base}_clean.{ext}"),
            None => format!("{file_path}_clean"),
        }
    }

    pub async fn spawn(self: Arc<Self>, bus: Arc<dyn MessageBus>) -> Result<(), crate::bus::BusError> {
        let worker = self.clone();
        bus.subscribe(
            Topics::AUDIO_PROCESSING_REQUEST,
            Arc::new(move |msg: Message| {
                let worker = worker.clone();
                Box::pin(async move { worker.handle_audio_processing_request(msg).await })
            }),
        )
        .await
    }

    async fn handle_audio_processing_request(&self, message: Message) {
        let correlation_id = message.correlation_id;
        let (file_path, transcript_path) = match (
            message.get_str("file_path").map(str::to_string),
            message.get_str("transcript_path").map(str::to_string),
        ) {
            (Some(file_path), Some(transcript_path)) => (file_path, transcript_path),
            _ => {
                warn!(message_id = %message.message_id, "invalid audio processing request: missing file_path or transcript_path");
                self.publish_failed(correlation_id, "Missing file_path or transcript_path", None)
                    .await;
                return;
            }
        };

        match self.remove_ads(&file_path, &transcript_path).await {
            Ok(output_path) => {
                let mut data = Map::new();
                data.insert("input_path".into(), json!(file_path));
                data.insert("output_path".into(), json!(output_path));
                if let Err(err) = self
                    .bus
                    .publish(Message::new(
                        Topics::AUDIO_PROCESSING_COMPLETE,
                        data,
                        correlation_id.unwrap_or_else(Uuid::new_v4),
                    ))
                    .await
                {
                    error!(error = %err, "failed to publish audio_processing.complete");
                }
            }
            Err(err) => {
                error!(%file_path, error = %err, "audio processing failed");
                self.publish_failed(correlation_id, &err.to_string(), Some(&file_path)).await;
            }
        }
    }

    async fn remove_ads(&self, file_path: &str, transcript_path: &str) -> anyhow::Result<String> {
        let transcript_bytes = self.blobstore.get(transcript_path).await?;
        let transcript: Transcript = serde_json::from_slice(&transcript_bytes)?;

        let intervals = ad_segment_intervals(&transcript.segments);
        let cuts = merge_cut_segments(&intervals, self.max_gap, self.min_duration);

        if cuts.is_empty() {
            info!(%file_path, "no ads found, nothing to remove");
            return Ok(file_path.to_string());
        }

        info!(%file_path, cut_count = cuts.len(), "removing ads from audio");

        let audio_bytes = self.blobstore.get(file_path).await?;
        let temp_dir = std::env::temp_dir();
        let extension = file_path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("mp3");
        let input_temp: PathBuf = temp_dir.join(format!("podcleaner-in-{}.{extension}", Uuid::new_v4()));
        let output_temp: PathBuf = temp_dir.join(format!("podcleaner-out-{}.{extension}", Uuid::new_v4()));

        tokio::fs::write(&input_temp, &audio_bytes).await?;
        let edit_result = self.editor.remove_segments(&input_temp, &output_temp, &cuts).await;
        let _ = tokio::fs::remove_file(&input_temp).await;
        edit_result?;

        let output_bytes = tokio::fs::read(&output_temp).await?;
        let _ = tokio::fs::remove_file(&output_temp).await;

        let output_key = Self::output_key(file_path);
        self.blobstore.put(&output_key, bytes::Bytes::from(output_bytes)).await?;

        info!(%file_path, output_key = %output_key, "audio processing complete");
        Ok(output_key)
    }

    async fn publish_failed(&self, correlation_id: Option<Uuid>, error_text: &str, file_path: Option<&str>) {
        let mut data = Map::new();
        data.insert("error".into(), json!(error_text));
        if let Some(file_path) = file_path {
            data.insert("file_path".into(), json!(file_path));
        }

        if let Err(err) = self
            .bus
            .publish(Message::new(Topics::AUDIO_PROCESSING_FAILED, data, correlation_id.unwrap_or_else(Uuid::new_v4)))
            .await
        {
            error!(error = %err, "failed to publish audio_processing.failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_key_preserves_extension_and_inserts_clean_suffix() {
        assert_eq!(AudioProcessorWorker::output_key("abc123.mp3"), "abc123_clean.mp3");
    }

    #[test]
    fn output_key_without_extension_falls_back_to_a_suffix() {
        assert_eq!(AudioProcessorWorker::output_key("abc123"), "abc123_clean");
    }
}
