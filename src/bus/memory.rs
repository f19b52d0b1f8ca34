//! In-process fan-out bus: handlers run as tokio tasks on the publisher's
//! own runtime. Dispatch order follows subscription order; completion order
//! is unspecified since each handler invocation is independently spawned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use super::{BusError, Handler, Message, MessageBus};

#[derive(Default)]
pub struct InMemoryMessageBus {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
    running: AtomicBool,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, msg: Message) -> Result<(), BusError> {
        if !self.running.load(Ordering::SeqCst) {
            warn!(topic = %msg.topic, "publish on a bus that has not been started; dropping");
            return Ok(());
        }

        let handlers = self.handlers.read().await;
        if let Some(subscribers) = handlers.get(&msg.topic) {
            for handler in subscribers {
                let handler = handler.clone();
                let msg = msg.clone();
                tokio::spawn(async move { handler(msg).await });
            }
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), BusError> {
        let mut handlers = self.handlers.write().await;
        handlers.entry(topic.to_string()).or_default().push(handler);
        Ok(())
    }

    async fn start(&self) -> Result<(), BusError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}
