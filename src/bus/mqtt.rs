//! MQTT-backed bus for microservice deployments: each worker process
//! connects independently to the same broker. Resubscribes to every topic
//! it has ever subscribed to on every reconnect, mirroring the original
//! `MQTTMessageBroker._on_connect` behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::constants::mqtt::KEEP_ALIVE;

use super::{BusError, Handler, Message, MessageBus};

/// Connection parameters for the MQTT backend.
#[derive(Debug, Clone)]
pub struct MqttConnectionOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

type HandlerTable = Arc<RwLock<HashMap<String, Vec<Handler>>>>;

pub struct MqttMessageBus {
    client: AsyncClient,
    eventloop: Mutex<Option<rumqttc::EventLoop>>,
    handlers: HandlerTable,
    running: AtomicBool,
}

impl MqttMessageBus {
    pub fn new(opts: MqttConnectionOptions) -> Self {
        let mut mqtt_options = MqttOptions::new(opts.client_id, opts.host, opts.port);
        mqtt_options.set_keep_alive(KEEP_ALIVE);
        if let (Some(username), Some(password)) = (opts.username, opts.password) {
            mqtt_options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 256);

        Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            running: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MessageBus for MqttMessageBus {
    async fn publish(&self, msg: Message) -> Result<(), BusError> {
        if !self.running.load(Ordering::SeqCst) {
            warn!(topic = %msg.topic, "publish on an mqtt bus that has not been started; dropping");
            return Ok(());
        }

        let payload = serde_json::to_vec(&msg)?;
        self.client
            .publish(&msg.topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| BusError::Transport(err.to_string()))
    }

    async fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), BusError> {
        {
            let mut handlers = self.handlers.write().await;
            handlers.entry(topic.to_string()).or_default().push(handler);
        }

        if self.running.load(Ordering::SeqCst) {
            self.client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|err| BusError::Transport(err.to_string()))?;
        }

        Ok(())
    }

    async fn start(&self) -> Result<(), BusError> {
        let eventloop = self
            .eventloop
            .lock()
            .await
            .take()
            .ok_or_else(|| BusError::Transport("mqtt bus already started".to_string()))?;

        self.running.store(true, Ordering::SeqCst);

        // `run_event_loop` resubscribes to every known topic on its own first
        // `ConnAck`, so there is no need to subscribe again here — this just
        // hands the connection and the shared handler table to the
        // background task and returns once it's spawned, matching the
        // original's `start()` returning once the broker thread is running
        // rather than blocking on it.
        tokio::spawn(Self::run_event_loop(
            eventloop,
            self.client.clone(),
            self.handlers.clone(),
        ));

        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        self.running.store(false, Ordering::SeqCst);
        self.client
            .disconnect()
            .await
            .map_err(|err| BusError::Transport(err.to_string()))
    }
}

impl MqttMessageBus {
    async fn run_event_loop(
        mut eventloop: rumqttc::EventLoop,
        client: AsyncClient,
        handlers: HandlerTable,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected; resubscribing to all known topics");
                    let topics: Vec<String> = handlers.read().await.keys().cloned().collect();
                    for topic in topics {
                        if let Err(err) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                            error!(%topic, error = %err, "failed to resubscribe after reconnect");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match serde_json::from_slice::<Message>(&publish.payload) {
                        Ok(msg) => {
                            let subscribers = handlers.read().await;
                            if let Some(handlers_for_topic) = subscribers.get(publish.topic.as_str())
                            {
                                for handler in handlers_for_topic {
                                    let handler = handler.clone();
                                    let msg = msg.clone();
                                    tokio::spawn(async move { handler(msg).await });
                                }
                            }
                        }
                        Err(err) => {
                            error!(topic = %publish.topic, error = %err, "failed to decode mqtt payload");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "mqtt connection error; rumqttc will reconnect automatically");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_options_accept_anonymous_credentials() {
        let opts = MqttConnectionOptions {
            host: "localhost".into(),
            port: 1883,
            client_id: "podcleaner-test".into(),
            username: None,
            password: None,
        };
        let bus = MqttMessageBus::new(opts);
        assert!(!bus.running.load(Ordering::SeqCst));
    }
}
