use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::manager::{ConnectionManager, Link};
use super::{BrokerChannel, BrokerError, Delivery, DeliveryStream, HandlerError};

#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<(), HandlerError>;
}

struct Registration {
    queue: String,
    handler: Arc<dyn DeliveryHandler>,
    /// Link generation the consumer currently runs on.
    generation: Option<u64>,
}

/// Every queue subscription of the process, in registration order.
/// Subscriptions are permanent; after a reconnect each one is consumed again
/// on the new channel.
#[derive(Default)]
pub struct ConsumerRegistry {
    entries: Mutex<Vec<Registration>>,
}

impl ConsumerRegistry {
    /// Returns false when the queue was already registered.
    pub async fn register(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|entry| entry.queue == queue) {
            return false;
        }
        entries.push(Registration {
            queue: queue.to_string(),
            handler,
            generation: None,
        });
        true
    }

    pub async fn queues(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        entries.iter().map(|entry| entry.queue.clone()).collect()
    }

    /// Start a consumer on `link` for every registration not yet running on it.
    pub(crate) async fn replay(&self, manager: &ConnectionManager, link: &Link) {
        let mut entries = self.entries.lock().await;
        if entries
            .iter()
            .all(|entry| entry.generation == Some(link.generation))
        {
            return;
        }

        if let Err(err) = link.channel.set_prefetch(manager.settings().prefetch).await {
            warn!(error = %err, "failed to set prefetch");
            manager.connection_lost(link.generation, &err.to_string());
            return;
        }

        for entry in entries.iter_mut() {
            if entry.generation == Some(link.generation) {
                continue;
            }
            match start_consumer(manager, link, entry).await {
                Ok(()) => {
                    entry.generation = Some(link.generation);
                    info!(queue = %entry.queue, generation = link.generation, "consumer started");
                }
                Err(err) => {
                    warn!(queue = %entry.queue, error = %err, "failed to start consumer");
                    manager.connection_lost(link.generation, &err.to_string());
                    return;
                }
            }
        }
    }
}

async fn start_consumer(
    manager: &ConnectionManager,
    link: &Link,
    entry: &Registration,
) -> Result<(), BrokerError> {
    link.channel.assert_queue(&entry.queue).await?;
    let consumer_tag = format!("chat-pipeline-{}", Uuid::new_v4());
    let deliveries = link.channel.consume(&entry.queue, &consumer_tag).await?;
    let consumer = QueueConsumer {
        queue: entry.queue.clone(),
        handler: entry.handler.clone(),
        channel: link.channel.clone(),
        generation: link.generation,
        dead_letter_queue: manager.settings().dead_letter_queue.clone(),
        manager: manager.weak(),
    };
    tokio::spawn(consumer.run(deliveries));
    Ok(())
}

struct QueueConsumer {
    queue: String,
    handler: Arc<dyn DeliveryHandler>,
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
    dead_letter_queue: Option<String>,
    manager: Weak<ConnectionManager>,
}

impl QueueConsumer {
    /// Deliveries are handled one at a time; the next is not pulled until the
    /// current one is acked or nacked.
    async fn run(self, mut deliveries: DeliveryStream) {
        while let Some(next) = deliveries.next().await {
            match next {
                Ok(delivery) => self.process(delivery).await,
                Err(err) => {
                    warn!(queue = %self.queue, error = %err, "delivery stream failed");
                    break;
                }
            }
        }
        debug!(queue = %self.queue, generation = self.generation, "consumer stopped");
        if let Some(manager) = self.manager.upgrade() {
            manager.connection_lost(self.generation, "consumer stream ended");
        }
    }

    async fn process(&self, delivery: Delivery) {
        let outcome = match serde_json::from_slice::<Value>(&delivery.body) {
            Ok(payload) => self.handler.handle(payload).await,
            Err(err) => Err(HandlerError::InvalidPayload(err.to_string())),
        };

        match outcome {
            Ok(()) => {
                if let Err(err) = self.channel.ack(delivery.delivery_tag).await {
                    warn!(queue = %self.queue, error = %err, "ack failed");
                }
            }
            Err(err) => {
                warn!(queue = %self.queue, error = %err, "handler failed; dropping delivery");
                self.dead_letter(&delivery, &err).await;
                if let Err(err) = self.channel.nack(delivery.delivery_tag, false).await {
                    warn!(queue = %self.queue, error = %err, "nack failed");
                }
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, err: &HandlerError) {
        let Some(dead_letter_queue) = &self.dead_letter_queue else {
            return;
        };
        let record = json!({
            "queue": delivery.queue,
            "error": err.to_string(),
            "body": String::from_utf8_lossy(&delivery.body),
            "failedAt": Utc::now().to_rfc3339(),
        });
        let body = record.to_string().into_bytes();
        let result = async {
            self.channel.assert_queue(dead_letter_queue).await?;
            self.channel.publish(dead_letter_queue, &body, true).await
        }
        .await;
        if let Err(err) = result {
            warn!(queue = %dead_letter_queue, error = %err, "failed to dead-letter delivery");
        }
    }
}
