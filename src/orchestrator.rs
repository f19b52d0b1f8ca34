//! Single-shot CLI pipeline: runs one URL through the full bus-driven
//! pipeline inside an otherwise private in-process bus, then exits. Uses a
//! `tokio::sync::oneshot` rendezvous keyed by correlation id, rather than a
//! polled flag, to learn when the run has finished — the orchestrator *is*
//! the only subscriber advancing each stage, so it always knows exactly when
//! the terminal event lands.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Map};
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::blobstore::BlobStore;
use crate::bus::{Message, MessageBus, Topics};
use crate::config::Config;
use crate::pipeline::{self, WorkerSelection};

/// What a completed run produced, before the caller decides where to write it.
pub struct PipelineOutcome {
    pub output_key: String,
    pub input_path: Option<String>,
    pub transcript_path: Option<String>,
}

struct InFlight {
    sender: oneshot::Sender<Result<PipelineOutcome, String>>,
    file_path: Option<String>,
    transcript_path: Option<String>,
}

/// Drives exactly the stages a single `/process`-equivalent request needs,
/// scoped to the correlation ids it itself mints.
pub struct Orchestrator {
    bus: Arc<dyn MessageBus>,
    blobstore: Arc<dyn BlobStore>,
    pending: Arc<Mutex<HashMap<Uuid, InFlight>>>,
}

impl Orchestrator {
    pub async fn new(config: &Config) -> Result<Self> {
        let bus = pipeline::build_bus(config);
        let blobstore = pipeline::spawn_workers(config, bus.clone(), WorkerSelection::All).await?;

        let pending: Arc<Mutex<HashMap<Uuid, InFlight>>> = Arc::new(Mutex::new(HashMap::new()));
        register_handlers(bus.clone(), pending.clone()).await?;

        bus.start().await.context("failed to start message bus")?;

        Ok(Self { bus, blobstore, pending })
    }

    /// Run one podcast episode through the pipeline and return the blob key
    /// holding the rendered (or untouched, if no ads were found) result.
    pub async fn run(&self, url: &str) -> Result<PipelineOutcome> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        self.pending.lock().await.insert(
            request_id,
            InFlight { sender: tx, file_path: None, transcript_path: None },
        );

        info!(%request_id, %url, "starting pipeline run");

        let mut data = Map::new();
        data.insert("url".into(), json!(url));
        self.bus
            .publish(Message::new(Topics::DOWNLOAD_REQUEST, data, request_id))
            .await
            .context("failed to publish download.request")?;

        match rx.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(error)) => Err(anyhow!("pipeline failed: {error}")),
            Err(_) => Err(anyhow!("pipeline run was dropped before completing")),
        }
    }

    /// Fetch the output blob, write it to `output_path`, and optionally
    /// remove the downloaded-audio and transcript blobs the run produced
    /// along the way (the rendered output blob itself is never deleted —
    /// it is the result, already copied out to `output_path`).
    pub async fn finish(&self, outcome: PipelineOutcome, output_path: &std::path::Path, keep_intermediate: bool) -> Result<()> {
        let bytes = self.blobstore.get(&outcome.output_key).await.context("failed to read pipeline output")?;
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output_path, &bytes).await.context("failed to write output file")?;

        if !keep_intermediate {
            for key in [outcome.input_path.as_deref(), outcome.transcript_path.as_deref()].into_iter().flatten() {
                if let Err(err) = self.blobstore.delete(key).await {
                    warn!(%key, error = %err, "failed to clean up intermediate blob");
                }
            }
        }

        Ok(())
    }
}

async fn register_handlers(bus: Arc<dyn MessageBus>, pending: Arc<Mutex<HashMap<Uuid, InFlight>>>) -> Result<()> {
    subscribe(&bus, Topics::DOWNLOAD_COMPLETE, pending.clone(), {
        let bus = bus.clone();
        move |request_id, message, pending| {
            let bus = bus.clone();
            async move {
                let Some(file_path) = message.get_str("file_path").map(str::to_string) else { return };
                if let Some(entry) = pending.lock().await.get_mut(&request_id) {
                    entry.file_path = Some(file_path.clone());
                }

                let mut data = Map::new();
                data.insert("file_path".into(), json!(file_path));
                if let Err(err) = bus.publish(Message::new(Topics::TRANSCRIBE_REQUEST, data, request_id)).await {
                    resolve_failed(&pending, request_id, format!("failed to request transcription: {err}")).await;
                }
            }
        }
    })
    .await?;

    subscribe(&bus, Topics::DOWNLOAD_FAILED, pending.clone(), |request_id, message, pending| async move {
        let error = message.get_str("error").unwrap_or("download failed").to_string();
        resolve_failed(&pending, request_id, error).await;
    })
    .await?;

    subscribe(&bus, Topics::TRANSCRIBE_COMPLETE, pending.clone(), {
        let bus = bus.clone();
        move |request_id, message, pending| {
            let bus = bus.clone();
            async move {
                let (Some(file_path), Some(transcript_path)) = (
                    message.get_str("file_path").map(str::to_string),
                    message.get_str("transcript_path").map(str::to_string),
                ) else {
                    return;
                };

                if let Some(entry) = pending.lock().await.get_mut(&request_id) {
                    entry.transcript_path = Some(transcript_path.clone());
                }

                let mut data = Map::new();
                data.insert("file_path".into(), json!(file_path));
                data.insert("transcript_path".into(), json!(transcript_path));
                if let Err(err) = bus.publish(Message::new(Topics::AD_DETECTION_REQUEST, data, request_id)).await {
                    resolve_failed(&pending, request_id, format!("failed to request ad detection: {err}")).await;
                }
            }
        }
    })
    .await?;

    subscribe(&bus, Topics::TRANSCRIBE_FAILED, pending.clone(), |request_id, message, pending| async move {
        let error = message.get_str("error").unwrap_or("transcription failed").to_string();
        resolve_failed(&pending, request_id, error).await;
    })
    .await?;

    subscribe(&bus, Topics::AD_DETECTION_COMPLETE, pending.clone(), {
        let bus = bus.clone();
        move |request_id, message, pending| {
            let bus = bus.clone();
            async move {
                let (Some(file_path), Some(transcript_path)) = (
                    message.get_str("file_path").map(str::to_string),
                    message.get_str("transcript_path").map(str::to_string),
                ) else {
                    return;
                };

                let mut data = Map::new();
                data.insert("file_path".into(), json!(file_path));
                data.insert("transcript_path".into(), json!(transcript_path));
                if let Err(err) = bus.publish(Message::new(Topics::AUDIO_PROCESSING_REQUEST, data, request_id)).await {
                    resolve_failed(&pending, request_id, format!("failed to request audio processing: {err}")).await;
                }
            }
        }
    })
    .await?;

    subscribe(&bus, Topics::AD_DETECTION_FAILED, pending.clone(), |request_id, message, pending| async move {
        let error = message.get_str("error").unwrap_or("ad detection failed").to_string();
        resolve_failed(&pending, request_id, error).await;
    })
    .await?;

    subscribe(&bus, Topics::AD_DETECTION_IN_PROGRESS, pending.clone(), |request_id, _message, _pending| async move {
        info!(%request_id, "ad detection reported partial progress; continuing to wait");
    })
    .await?;

    subscribe(&bus, Topics::AUDIO_PROCESSING_COMPLETE, pending.clone(), |request_id, message, pending| async move {
        let Some(output_path) = message.get_str("output_path").map(str::to_string) else { return };
        if let Some(entry) = pending.lock().await.remove(&request_id) {
            let _ = entry.sender.send(Ok(PipelineOutcome {
                output_key: output_path,
                input_path: entry.file_path,
                transcript_path: entry.transcript_path,
            }));
        }
    })
    .await?;

    subscribe(&bus, Topics::AUDIO_PROCESSING_FAILED, pending.clone(), |request_id, message, pending| async move {
        let error = message.get_str("error").unwrap_or("audio processing failed").to_string();
        resolve_failed(&pending, request_id, error).await;
    })
    .await?;

    Ok(())
}

async fn resolve_failed(pending: &Arc<Mutex<HashMap<Uuid, InFlight>>>, request_id: Uuid, error: String) {
    if let Some(entry) = pending.lock().await.remove(&request_id) {
        let _ = entry.sender.send(Err(error));
    }
}

/// Subscribes `handler` to `topic`, but only invokes it for correlation ids
/// the orchestrator itself is tracking — messages from an unrelated,
/// concurrently running pipeline (same bus, different run) are ignored.
async fn subscribe<F, Fut>(
    bus: &Arc<dyn MessageBus>,
    topic: &str,
    pending: Arc<Mutex<HashMap<Uuid, InFlight>>>,
    handler: F,
) -> Result<()>
where
    F: Fn(Uuid, Message, Arc<Mutex<HashMap<Uuid, InFlight>>>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let handler = Arc::new(handler);

    bus.subscribe(
        topic,
        Arc::new(move |msg: Message| {
            let pending = pending.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let Some(request_id) = msg.correlation_id else {
                    warn!(message_id = %msg.message_id, "orchestrator received a message with no correlation id");
                    return;
                };
                if !pending.lock().await.contains_key(&request_id) {
                    return;
                }
                handler(request_id, msg, pending).await;
            })
        }),
    )
    .await
    .context("failed to subscribe orchestrator handler")?;

    Ok(())
}

/// Entry point for the CLI's `process` subcommand.
pub async fn run_once(
    config: &Config,
    url: &str,
    output_path: &std::path::Path,
    keep_intermediate: bool,
) -> Result<()> {
    let orchestrator = Orchestrator::new(config).await?;
    let outcome = orchestrator.run(url).await?;
    orchestrator.finish(outcome, output_path, keep_intermediate).await
}
