use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use super::{BrokerChannel, BrokerConnector, BrokerError, BrokerSession, Delivery, DeliveryStream};

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

fn channel_error(err: lapin::Error) -> BrokerError {
    BrokerError::Channel(err.to_string())
}

/// A publish only counts once the broker has taken responsibility for it.
fn confirmed(confirmation: Confirmation) -> Result<(), BrokerError> {
    if confirmation.is_nack() {
        return Err(BrokerError::Channel("publish rejected by broker".to_string()));
    }
    Ok(())
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<BrokerSession, BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|err| BrokerError::Connect(err.to_string()))?;

        let (lost_tx, lost_rx) = oneshot::channel();
        let lost_tx = Mutex::new(Some(lost_tx));
        connection.on_error(move |err| {
            if let Some(sender) = lost_tx.lock().take() {
                let _ = sender.send(err.to_string());
            }
        });

        let channel = connection.create_channel().await.map_err(channel_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(channel_error)?;
        debug!(channel_id = channel.id(), "amqp channel opened");
        Ok(BrokerSession {
            channel: Arc::new(AmqpChannel {
                connection,
                channel,
            }),
            lost: lost_rx,
        })
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(if persistent { PERSISTENT } else { TRANSIENT });
        let confirmation = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(channel_error)?
            .await
            .map_err(channel_error)?;
        confirmed(confirmation)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;
        let queue = queue.to_string();
        let deliveries = consumer.map(move |item| {
            item.map(|delivery| Delivery {
                delivery_tag: delivery.delivery_tag,
                queue: queue.clone(),
                body: delivery.data,
            })
            .map_err(channel_error)
        });
        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(channel_error)
    }

    async fn close(&self) {
        let _ = self.channel.close(200, "closing").await;
        let _ = self.connection.close(200, "closing").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nacked_publish_is_an_error() {
        assert!(matches!(
            confirmed(Confirmation::Nack(None)),
            Err(BrokerError::Channel(_))
        ));
        assert!(confirmed(Confirmation::Ack(None)).is_ok());
    }
}
