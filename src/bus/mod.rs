//! Topic-based publish/subscribe message bus with correlation-id preservation.
//!
//! Two backends share the [`MessageBus`] trait surface, in the same way
//! `storage::Storage` gives `JsonStorage` a single call surface other
//! backends could later implement: an in-process fan-out (`memory`) and an
//! external MQTT broker (`mqtt`). Both deliver at-least-once with no
//! ordering guarantees across publishers — every handler must be
//! idempotent.

pub mod memory;
pub mod mqtt;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemoryMessageBus;
pub use mqtt::MqttMessageBus;

/// A bus message. `data` is intentionally loosely typed (a JSON object) —
/// each worker decodes only the keys its topic requires and publishes a
/// `_FAILED` message for payloads missing a required key, rather than
/// rejecting the message at the bus layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub data: Map<String, Value>,
    pub message_id: Uuid,
    pub correlation_id: Option<Uuid>,
}

impl Message {
    pub fn new(topic: impl Into<String>, data: Map<String, Value>, correlation_id: Uuid) -> Self {
        Self {
            topic: topic.into(),
            data,
            message_id: Uuid::new_v4(),
            correlation_id: Some(correlation_id),
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(Value::as_bool)
    }
}

/// The closed set of topics the pipeline publishes/subscribes to.
pub struct Topics;

impl Topics {
    pub const DOWNLOAD_REQUEST: &'static str = "podcast.download.request";
    pub const DOWNLOAD_COMPLETE: &'static str = "podcast.download.complete";
    pub const DOWNLOAD_FAILED: &'static str = "podcast.download.failed";

    pub const TRANSCRIBE_REQUEST: &'static str = "podcast.transcribe.request";
    pub const TRANSCRIBE_COMPLETE: &'static str = "podcast.transcribe.complete";
    pub const TRANSCRIBE_FAILED: &'static str = "podcast.transcribe.failed";

    pub const AD_DETECTION_REQUEST: &'static str = "podcast.ad_detection.request";
    pub const AD_DETECTION_COMPLETE: &'static str = "podcast.ad_detection.complete";
    pub const AD_DETECTION_FAILED: &'static str = "podcast.ad_detection.failed";
    pub const AD_DETECTION_IN_PROGRESS: &'static str = "podcast.ad_detection.in_progress";

    pub const AUDIO_PROCESSING_REQUEST: &'static str = "podcast.audio_processing.request";
    pub const AUDIO_PROCESSING_COMPLETE: &'static str = "podcast.audio_processing.complete";
    pub const AUDIO_PROCESSING_FAILED: &'static str = "podcast.audio_processing.failed";

    pub const RSS_DOWNLOAD_REQUEST: &'static str = "podcast.rss.download.request";
    pub const RSS_DOWNLOAD_COMPLETE: &'static str = "podcast.rss.download.complete";
    pub const RSS_DOWNLOAD_FAILED: &'static str = "podcast.rss.download.failed";

    pub const API_STATUS_UPDATE: &'static str = "api.status.update";

    /// Every topic a worker or the HTTP front-end might subscribe to; used by
    /// the MQTT backend to resubscribe in full after a reconnect.
    pub const ALL: &'static [&'static str] = &[
        Self::DOWNLOAD_REQUEST,
        Self::DOWNLOAD_COMPLETE,
        Self::DOWNLOAD_FAILED,
        Self::TRANSCRIBE_REQUEST,
        Self::TRANSCRIBE_COMPLETE,
        Self::TRANSCRIBE_FAILED,
        Self::AD_DETECTION_REQUEST,
        Self::AD_DETECTION_COMPLETE,
        Self::AD_DETECTION_FAILED,
        Self::AD_DETECTION_IN_PROGRESS,
        Self::AUDIO_PROCESSING_REQUEST,
        Self::AUDIO_PROCESSING_COMPLETE,
        Self::AUDIO_PROCESSING_FAILED,
        Self::RSS_DOWNLOAD_REQUEST,
        Self::RSS_DOWNLOAD_COMPLETE,
        Self::RSS_DOWNLOAD_FAILED,
        Self::API_STATUS_UPDATE,
    ];
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message bus transport error: {0}")]
    Transport(String),
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("message bus is not started")]
    NotStarted,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Shared contract for the in-process and MQTT-backed buses.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver `msg` to every handler subscribed to `msg.topic`. Publishing
    /// while not started is a no-op (logged as a warning), not an error,
    /// matching the original `InMemoryMessageBroker.publish`'s tolerant
    /// behavior.
    async fn publish(&self, msg: Message) -> Result<(), BusError>;

    /// Register `handler` to run for every future message on `topic`.
    async fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), BusError>;

    /// Begin delivering messages (connect to the broker, or simply flip the
    /// in-process bus's running flag).
    async fn start(&self) -> Result<(), BusError>;

    /// Stop delivering messages.
    async fn stop(&self) -> Result<(), BusError>;
}
