//! An in-process broker with AMQP-like semantics: durable queues, per-channel
//! prefetch, manual ack/nack, and requeue of unacknowledged deliveries when a
//! connection drops. Used by `BROKER_URL=memory://` and by the tests, which
//! can take it offline or drop every connection to simulate broker failures.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use super::{BrokerChannel, BrokerConnector, BrokerError, BrokerSession, Delivery, DeliveryStream};

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    changed: Notify,
}

#[derive(Default)]
struct BrokerState {
    unavailable: bool,
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    connections: HashMap<u64, MemoryConnection>,
    next_connection: u64,
    next_tag: u64,
    connect_attempts: usize,
    connect_count: usize,
}

struct MemoryConnection {
    open: bool,
    prefetch: u16,
    lost: Option<oneshot::Sender<String>>,
    unacked: BTreeMap<u64, Unacked>,
}

struct Unacked {
    queue: String,
    body: Vec<u8>,
    consumer_tag: String,
}

impl BrokerState {
    fn open_connection(&mut self, id: u64) -> Result<&mut MemoryConnection, BrokerError> {
        match self.connections.get_mut(&id) {
            Some(connection) if connection.open => Ok(connection),
            _ => Err(BrokerError::Closed),
        }
    }

    /// Mark the connection closed and put its unacked deliveries back at the
    /// head of their queues, oldest first.
    fn shut(&mut self, id: u64) -> Option<oneshot::Sender<String>> {
        let connection = self.connections.get_mut(&id)?;
        if !connection.open {
            return None;
        }
        connection.open = false;
        let unacked = std::mem::take(&mut connection.unacked);
        let lost = connection.lost.take();
        for (_, delivery) in unacked.into_iter().rev() {
            self.queues
                .entry(delivery.queue)
                .or_default()
                .push_front(delivery.body);
        }
        lost
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// While unavailable every connect attempt fails.
    pub fn set_available(&self, available: bool) {
        self.inner.state.lock().unavailable = !available;
    }

    /// Sever every open connection as a broker restart would.
    pub fn drop_connections(&self) {
        let lost = {
            let mut state = self.inner.state.lock();
            let ids = state.connections.keys().copied().collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| state.shut(id))
                .collect::<Vec<_>>()
        };
        for sender in lost {
            let _ = sender.send("connection reset by broker".to_string());
        }
        self.inner.changed.notify_waiters();
    }

    /// Enqueue a raw body without going through a connection.
    pub fn publish_raw(&self, queue: &str, body: &[u8]) {
        self.inner
            .state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(body.to_vec());
        self.inner.changed.notify_waiters();
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|messages| messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .connections
            .values()
            .map(|connection| connection.unacked.len())
            .sum()
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.state.lock().connect_attempts
    }

    pub fn connect_count(&self) -> usize {
        self.inner.state.lock().connect_count
    }
}

pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self) -> Result<BrokerSession, BrokerError> {
        let (lost_tx, lost_rx) = oneshot::channel();
        let id = {
            let mut state = self.broker.inner.state.lock();
            state.connect_attempts += 1;
            if state.unavailable {
                return Err(BrokerError::Connect(
                    "memory broker unavailable".to_string(),
                ));
            }
            state.next_connection += 1;
            let id = state.next_connection;
            state.connections.insert(
                id,
                MemoryConnection {
                    open: true,
                    prefetch: 0,
                    lost: Some(lost_tx),
                    unacked: BTreeMap::new(),
                },
            );
            state.connect_count += 1;
            id
        };
        Ok(BrokerSession {
            channel: Arc::new(MemoryChannel {
                inner: self.broker.inner.clone(),
                connection: id,
            }),
            lost: lost_rx,
        })
    }
}

struct MemoryChannel {
    inner: Arc<BrokerInner>,
    connection: u64,
}

enum Step {
    Deliver(Delivery),
    Wait,
    End,
}

struct ConsumerCursor {
    inner: Arc<BrokerInner>,
    connection: u64,
    queue: String,
    consumer_tag: String,
}

impl ConsumerCursor {
    fn step(&self) -> Step {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let Some(connection) = state.connections.get_mut(&self.connection) else {
            return Step::End;
        };
        if !connection.open {
            return Step::End;
        }
        let in_flight = connection
            .unacked
            .values()
            .filter(|delivery| delivery.consumer_tag == self.consumer_tag)
            .count();
        if connection.prefetch > 0 && in_flight >= connection.prefetch as usize {
            return Step::Wait;
        }
        let Some(body) = state
            .queues
            .get_mut(&self.queue)
            .and_then(VecDeque::pop_front)
        else {
            return Step::Wait;
        };
        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        connection.unacked.insert(
            delivery_tag,
            Unacked {
                queue: self.queue.clone(),
                body: body.clone(),
                consumer_tag: self.consumer_tag.clone(),
            },
        );
        Step::Deliver(Delivery {
            delivery_tag,
            queue: self.queue.clone(),
            body,
        })
    }
}

impl MemoryChannel {
    fn with_connection<T>(
        &self,
        apply: impl FnOnce(&mut BrokerState) -> Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        let result = {
            let mut state = self.inner.state.lock();
            state.open_connection(self.connection)?;
            apply(&mut state)
        };
        self.inner.changed.notify_waiters();
        result
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.with_connection(|state| {
            state.queues.entry(queue.to_string()).or_default();
            Ok(())
        })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.with_connection(|state| {
            state.open_connection(self.connection)?.prefetch = count;
            Ok(())
        })
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        _persistent: bool,
    ) -> Result<(), BrokerError> {
        self.with_connection(|state| {
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(body.to_vec());
            Ok(())
        })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.with_connection(|state| {
            state.queues.entry(queue.to_string()).or_default();
            Ok(())
        })?;
        let cursor = ConsumerCursor {
            inner: self.inner.clone(),
            connection: self.connection,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
        };
        let deliveries = stream::unfold(cursor, |cursor| async move {
            loop {
                let inner = cursor.inner.clone();
                let changed = inner.changed.notified();
                match cursor.step() {
                    Step::Deliver(delivery) => return Some((Ok(delivery), cursor)),
                    Step::End => return None,
                    Step::Wait => changed.await,
                }
            }
        });
        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.with_connection(|state| {
            state
                .open_connection(self.connection)?
                .unacked
                .remove(&delivery_tag)
                .map(|_| ())
                .ok_or_else(|| BrokerError::Channel(format!("unknown delivery tag {delivery_tag}")))
        })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.with_connection(|state| {
            let delivery = state
                .open_connection(self.connection)?
                .unacked
                .remove(&delivery_tag)
                .ok_or_else(|| {
                    BrokerError::Channel(format!("unknown delivery tag {delivery_tag}"))
                })?;
            if requeue {
                state
                    .queues
                    .entry(delivery.queue)
                    .or_default()
                    .push_front(delivery.body);
            }
            Ok(())
        })
    }

    async fn close(&self) {
        // the lost sender is dropped here, which the manager sees as a close
        let _ = self.inner.state.lock().shut(self.connection);
        self.inner.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefetch_one_holds_back_the_next_delivery_until_ack() {
        let broker = MemoryBroker::new();
        let session = broker.connector().connect().await.unwrap();
        let channel = session.channel;
        channel.set_prefetch(1).await.unwrap();
        for body in [b"1", b"2"] {
            channel.publish("q", body, true).await.unwrap();
        }

        let mut deliveries = channel.consume("q", "c1").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.body, b"1");

        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(30), deliveries.next()).await;
        assert!(pending.is_err(), "second delivery arrived before ack");

        channel.ack(first.delivery_tag).await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"2");
    }

    #[tokio::test]
    async fn dropped_connection_requeues_unacked_and_ends_streams() {
        let broker = MemoryBroker::new();
        let session = broker.connector().connect().await.unwrap();
        session.channel.publish("q", b"x", true).await.unwrap();
        let mut deliveries = session.channel.consume("q", "c1").await.unwrap();
        deliveries.next().await.unwrap().unwrap();
        assert_eq!(broker.queue_depth("q"), 0);

        broker.drop_connections();

        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.queue_depth("q"), 1);
        assert_eq!(session.lost.await.unwrap(), "connection reset by broker");
        assert!(matches!(
            session.channel.publish("q", b"y", true).await,
            Err(BrokerError::Closed)
        ));
    }
}
