//! Durable-queue plumbing: a transport seam (`BrokerConnector` /
//! `BrokerChannel`), the connection manager that owns the one live link, and
//! the consumer registry that replays subscriptions after a reconnect.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::store::StoreError;

pub mod amqp;
pub mod manager;
pub mod memory;
pub mod registry;

pub use manager::{ConnectionManager, LinkPhase, ManagerSettings};
pub use registry::DeliveryHandler;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(String),

    #[error("broker channel error: {0}")]
    Channel(String),

    #[error("broker connection closed")]
    Closed,
}

/// Failure reported by a queue handler. Any variant leads to a nack without
/// requeue.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Failed(String),
}

/// An outbound message addressed to a durable queue.
#[derive(Debug, Clone)]
pub struct QueueEnvelope {
    pub queue: String,
    pub payload: Value,
    pub persistent: bool,
}

impl QueueEnvelope {
    pub fn persistent(queue: impl Into<String>, payload: Value) -> Self {
        Self {
            queue: queue.into(),
            payload,
            persistent: true,
        }
    }
}

/// A message handed to a consumer; owned until it is acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub body: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// A freshly opened connection with its single channel. `lost` resolves when
/// the broker drops or closes the connection.
pub struct BrokerSession {
    pub channel: Arc<dyn BrokerChannel>,
    pub lost: oneshot::Receiver<String>,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<BrokerSession, BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable queue, creating it when missing.
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, body: &[u8], persistent: bool)
        -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self);
}
