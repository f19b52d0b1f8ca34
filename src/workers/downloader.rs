//! Downloads podcast audio by URL, keyed by `md5(url)` in the blob store, and
//! resolves RSS feeds into a [`PodcastInfo`] the HTTP front-end can rewrite
//! enclosure URLs from.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::{json, Map};
use tracing::{error, info, warn};

use crate::blobstore::BoxedBlobStore;
use crate::bus::{Message, MessageBus, Topics};
use crate::constants::network;
use crate::dedup::DedupSet;
use crate::model::{EpisodeInfo, PodcastInfo};

pub struct DownloaderWorker {
    client: reqwest::Client,
    blobstore: BoxedBlobStore,
    dedup: DedupSet,
    /// Separate dedup set for RSS feed URLs, persisted to
    /// `downloader_processed_rss.json` per spec.md §6's layout.
    rss_dedup: DedupSet,
    bus: Arc<dyn MessageBus>,
}

impl DownloaderWorker {
    pub fn new(blobstore: BoxedBlobStore, dedup: DedupSet, rss_dedup: DedupSet, bus: Arc<dyn MessageBus>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(network::DOWNLOAD_TIMEOUT)
            .connect_timeout(network::CONNECT_TIMEOUT)
            .user_agent(network::USER_AGENT)
            .build()
            .expect("reqwest client configuration should always be valid");

        Self { client, blobstore, dedup, rss_dedup, bus }
    }

    pub fn storage_key(url: &str) -> String {
        format!("{}{:x}", crate::constants::storage_keys::PODCAST_PREFIX, md5::compute(url.as_bytes()))
    }

    /// Register this worker's handlers on `bus`. Takes `self` by `Arc` since
    /// the bus retains the handler closures for the lifetime of the process.
    pub async fn spawn(self: Arc<Self>, bus: Arc<dyn MessageBus>) -> Result<(), crate::bus::BusError> {
        let download_worker = self.clone();
        bus.subscribe(
            Topics::DOWNLOAD_REQUEST,
            Arc::new(move |msg: Message| {
                let worker = download_worker.clone();
                Box::pin(async move { worker.handle_download_request(msg).await })
            }),
        )
        .await?;

        let rss_worker = self.clone();
        bus.subscribe(
            Topics::RSS_DOWNLOAD_REQUEST,
            Arc::new(move |msg: Message| {
                let worker = rss_worker.clone();
                Box::pin(async move { worker.handle_rss_download_request(msg).await })
            }),
        )
        .await?;

        Ok(())
    }

    async fn handle_download_request(&self, message: Message) {
        let correlation_id = message.correlation_id;
        let Some(url) = message.get_str("url").map(str::to_string) else {
            warn!(message_id = %message.message_id, "invalid download request: missing url");
            self.publish_failed(Topics::DOWNLOAD_FAILED, correlation_id, "No URL provided", None)
                .await;
            return;
        };

        let key = Self::storage_key(&url);

        match self.blobstore.exists(&key).await {
            Ok(true) => {
                info!(%url, "podcast already downloaded");
                self.publish_complete(&url, &key, true, correlation_id).await;
                return;
            }
            Ok(false) => {}
            Err(err) => {
                error!(%url, error = %err, "failed to check blob existence");
                self.publish_failed(Topics::DOWNLOAD_FAILED, correlation_id, &err.to_string(), Some(&url))
                    .await;
                return;
            }
        }

        if !self.dedup.begin(&key).await {
            warn!(%url, "download already in progress");
            self.publish_failed(
                Topics::DOWNLOAD_FAILED,
                correlation_id,
                "download already in progress",
                Some(&url),
            )
            .await;
            return;
        }

        match self.download(&url, &key).await {
            Ok(()) => {
                if let Err(err) = self.dedup.complete(&key).await {
                    error!(%url, error = %err, "failed to persist dedup state");
                }
                self.publish_complete(&url, &key, false, correlation_id).await;
            }
            Err(err) => {
                self.dedup.release(&key).await;
                error!(%url, error = %err, "download failed");
                self.publish_failed(Topics::DOWNLOAD_FAILED, correlation_id, &err.to_string(), Some(&url))
                    .await;
            }
        }
    }

    async fn download(&self, url: &str, key: &str) -> anyhow::Result<()> {
        info!(%url, "downloading podcast");
        let response = self.client.get(url).send().await?.error_for_status()?;

        let temp_path = std::env::temp_dir().join(format!("podcleaner-download-{}", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&temp_path).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = BytesMut::with_capacity(network::DOWNLOAD_CHUNK_SIZE);
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            while buffer.len() >= network::DOWNLOAD_CHUNK_SIZE {
                let piece = buffer.split_to(network::DOWNLOAD_CHUNK_SIZE);
                tokio::io::AsyncWriteExt::write_all(&mut file, &piece).await?;
            }
        }
        if !buffer.is_empty() {
            tokio::io::AsyncWriteExt::write_all(&mut file, &buffer).await?;
        }
        drop(file);

        let bytes = tokio::fs::read(&temp_path).await?;
        let put_result = self.blobstore.put(key, Bytes::from(bytes)).await;
        let _ = tokio::fs::remove_file(&temp_path).await;
        put_result?;

        info!(%url, "download complete");
        Ok(())
    }

    async fn publish_complete(&self, url: &str, key: &str, already_processed: bool, correlation_id: Option<uuid::Uuid>) {
        let mut data = Map::new();
        data.insert("url".into(), json!(url));
        data.insert("file_path".into(), json!(key));
        if already_processed {
            data.insert("already_processed".into(), json!(true));
        }

        if let Err(err) = self
            .bus
            .publish(Message::new(
                Topics::DOWNLOAD_COMPLETE,
                data,
                correlation_id.unwrap_or_else(uuid::Uuid::new_v4),
            ))
            .await
        {
            error!(error = %err, "failed to publish download.complete");
        }
    }

    async fn publish_failed(&self, topic: &str, correlation_id: Option<uuid::Uuid>, error_text: &str, url: Option<&str>) {
        let mut data = Map::new();
        data.insert("error".into(), json!(error_text));
        if let Some(url) = url {
            data.insert("url".into(), json!(url));
        }

        if let Err(err) = self
            .bus
            .publish(Message::new(topic, data, correlation_id.unwrap_or_else(uuid::Uuid::new_v4)))
            .await
        {
            error!(error = %err, "failed to publish failure message");
        }
    }

    async fn handle_rss_download_request(&self, message: Message) {
        let correlation_id = message.correlation_id;
        let Some(rss_url) = message.get_str("rss_url").map(str::to_string) else {
            warn!(message_id = %message.message_id, "invalid rss download request: missing rss_url");
            self.publish_failed(Topics::RSS_DOWNLOAD_FAILED, correlation_id, "No RSS URL provided", None)
                .await;
            return;
        };

        let base_url = message.get_str("base_url").map(str::to_string);

        if !self.rss_dedup.begin(&rss_url).await {
            warn!(%rss_url, "rss download already in progress");
            self.publish_failed(
                Topics::RSS_DOWNLOAD_FAILED,
                correlation_id,
                "rss download already in progress",
                None,
            )
            .await;
            return;
        }

        match self.download_rss(&rss_url, base_url.as_deref()).await {
            Ok(podcast_info) => {
                if let Err(err) = self.rss_dedup.complete(&rss_url).await {
                    error!(%rss_url, error = %err, "failed to persist rss dedup state");
                }

                let mut data = Map::new();
                data.insert("rss_url".into(), json!(rss_url));
                data.insert("podcast_info".into(), serde_json::to_value(&podcast_info).unwrap_or(json!({})));

                if let Err(err) = self
                    .bus
                    .publish(Message::new(
                        Topics::RSS_DOWNLOAD_COMPLETE,
                        data,
                        correlation_id.unwrap_or_else(uuid::Uuid::new_v4),
                    ))
                    .await
                {
                    error!(error = %err, "failed to publish rss.download.complete");
                }
            }
            Err(err) => {
                self.rss_dedup.release(&rss_url).await;
                error!(%rss_url, error = %err, "rss download failed");
                let mut data = Map::new();
                data.insert("rss_url".into(), json!(rss_url));
                data.insert("error".into(), json!(err.to_string()));
                if let Err(err) = self
                    .bus
                    .publish(Message::new(
                        Topics::RSS_DOWNLOAD_FAILED,
                        data,
                        correlation_id.unwrap_or_else(uuid::Uuid::new_v4),
                    ))
                    .await
                {
                    error!(error = %err, "failed to publish rss.download.failed");
                }
            }
        }
    }

    async fn download_rss(&self, rss_url: &str, base_url: Option<&str>) -> anyhow::Result<PodcastInfo> {
        fetch_podcast_info(&self.client, rss_url, base_url).await
    }
}

/// Fetch and parse an RSS feed into a [`PodcastInfo`], rewriting each
/// episode's enclosure URL to `{base_url}/process?url={original}` when
/// `base_url` is given. Shared by the bus-driven `DownloaderWorker` and the
/// HTTP front-end's synchronous `/rss` route, which cannot wait on a
/// round trip through the message bus.
pub async fn fetch_podcast_info(
    client: &reqwest::Client,
    rss_url: &str,
    base_url: Option<&str>,
) -> anyhow::Result<PodcastInfo> {
    info!(url = %rss_url, "downloading rss feed");
    let body = client.get(rss_url).send().await?.error_for_status()?.bytes().await?;
    let feed = feed_rs::parser::parse(&body[..])?;

    let mut episodes = Vec::new();
    for entry in &feed.entries {
        let Some(original_url) = entry
            .media
            .iter()
            .flat_map(|m| m.content.iter())
            .find(|c| {
                c.content_type
                    .as_ref()
                    .map(|t| t.to_string().starts_with("audio/"))
                    .unwrap_or(false)
            })
            .and_then(|c| c.url.as_ref())
            .map(|u| u.to_string())
        else {
            continue;
        };

        let audio_url = match base_url {
            Some(base) => format!("{}/process?url={}", base.trim_end_matches('/'), original_url),
            None => original_url.clone(),
        };

        let published: Option<DateTime<Utc>> = entry.published.or(entry.updated);

        episodes.push(EpisodeInfo {
            title: entry.title.as_ref().map(|t| t.content.clone()).unwrap_or_default(),
            description: entry.summary.as_ref().map(|s| s.content.clone()),
            published,
            audio_url,
            original_url: Some(original_url),
        });
    }

    info!(url = %rss_url, episode_count = episodes.len(), "rss download complete");

    Ok(PodcastInfo {
        title: feed.title.map(|t| t.content).unwrap_or_default(),
        description: feed.description.map(|d| d.content),
        link: feed.links.first().map(|l| l.href.clone()),
        episodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_is_the_md5_hex_digest_of_the_url() {
        let key = DownloaderWorker::storage_key("https://example.com/episode.mp3");
        assert!(key.starts_with("podcasts/"));
        let digest = key.strip_prefix("podcasts/").unwrap();
        assert_eq!(digest.len(), 32);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));

        // same URL always hashes to the same key, enabling the blob-existence short-circuit
        assert_eq!(key, DownloaderWorker::storage_key("https://example.com/episode.mp3"));
        assert_ne!(key, DownloaderWorker::storage_key("https://example.com/other.mp3"));
    }
}
