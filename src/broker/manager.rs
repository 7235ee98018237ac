//! Owner of the single broker connection and channel.
//!
//! The link moves through an explicit state machine guarded by one mutex:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Backoff -> Connecting -> ...
//!               \-----> Backoff (failed attempt)
//! any  -> Closed (explicit close, terminal)
//! ```
//!
//! Connect attempts are serialized by `connect_gate`, so callers that race on
//! a cold link wait for the attempt in flight instead of starting their own.
//! Entering `Backoff` from a live link (or from a failed first attempt) starts
//! exactly one retry loop that wakes on a fixed delay until a newer link
//! exists.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use super::registry::ConsumerRegistry;
use super::{BrokerChannel, BrokerConnector, BrokerError, DeliveryHandler, QueueEnvelope};

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub reconnect_delay: Duration,
    pub prefetch: u16,
    /// Where failed deliveries are copied before being dropped.
    pub dead_letter_queue: Option<String>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(5000),
            prefetch: 1,
            dead_letter_queue: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPhase {
    Idle,
    Connecting,
    Connected,
    Backoff,
    Closed,
}

#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) generation: u64,
}

enum LinkState {
    Idle,
    Connecting,
    Connected(Link),
    Backoff,
    Closed,
}

pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    settings: ManagerSettings,
    state: Mutex<LinkState>,
    connect_gate: AsyncMutex<()>,
    generation: AtomicU64,
    registry: ConsumerRegistry,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, settings: ManagerSettings) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            connector,
            settings,
            state: Mutex::new(LinkState::Idle),
            connect_gate: AsyncMutex::new(()),
            generation: AtomicU64::new(0),
            registry: ConsumerRegistry::default(),
            this: this.clone(),
        })
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn phase(&self) -> LinkPhase {
        match &*self.state.lock() {
            LinkState::Idle => LinkPhase::Idle,
            LinkState::Connecting => LinkPhase::Connecting,
            LinkState::Connected(_) => LinkPhase::Connected,
            LinkState::Backoff => LinkPhase::Backoff,
            LinkState::Closed => LinkPhase::Closed,
        }
    }

    /// Number of links established so far; bumps on every (re)connect.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn registered_queues(&self) -> Vec<String> {
        self.registry.queues().await
    }

    /// A ready channel, connecting on demand.
    pub async fn acquire(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        Ok(self.acquire_link().await?.channel)
    }

    /// Send a persistent JSON message to a durable queue. Failures are logged
    /// and reported as `false`; transport errors also schedule a reconnect.
    pub async fn publish<T: Serialize + ?Sized>(&self, queue: &str, payload: &T) -> bool {
        match serde_json::to_value(payload) {
            Ok(payload) => self.send(&QueueEnvelope::persistent(queue, payload)).await,
            Err(err) => {
                warn!(queue, error = %err, "failed to encode queue payload");
                false
            }
        }
    }

    pub async fn send(&self, envelope: &QueueEnvelope) -> bool {
        let body = envelope.payload.to_string().into_bytes();
        let link = match self.acquire_link().await {
            Ok(link) => link,
            Err(err) => {
                warn!(queue = %envelope.queue, error = %err, "broker unavailable; message not published");
                return false;
            }
        };
        let result = async {
            link.channel.assert_queue(&envelope.queue).await?;
            link.channel
                .publish(&envelope.queue, &body, envelope.persistent)
                .await
        }
        .await;
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(queue = %envelope.queue, error = %err, "publish failed");
                self.connection_lost(link.generation, &err.to_string());
                false
            }
        }
    }

    /// Register `handler` for `queue` and start consuming. The registration
    /// outlives this call: it is replayed on every reconnect, even when the
    /// broker is unreachable right now and this returns an error.
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), BrokerError> {
        if self.registry.register(queue, handler).await {
            info!(queue, "queue subscription registered");
        } else {
            debug!(queue, "queue already registered");
        }
        let link = self.acquire_link().await?;
        self.registry.replay(self, &link).await;
        Ok(())
    }

    /// Close the link for good; no reconnect follows.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), LinkState::Closed);
        if let LinkState::Connected(link) = previous {
            link.channel.close().await;
            info!(generation = link.generation, "broker connection closed");
        }
    }

    pub(crate) fn weak(&self) -> Weak<ConnectionManager> {
        self.this.clone()
    }

    fn current_link(&self) -> Result<Option<Link>, BrokerError> {
        match &*self.state.lock() {
            LinkState::Connected(link) => Ok(Some(link.clone())),
            LinkState::Closed => Err(BrokerError::Closed),
            _ => Ok(None),
        }
    }

    pub(crate) async fn acquire_link(&self) -> Result<Link, BrokerError> {
        if let Some(link) = self.current_link()? {
            return Ok(link);
        }
        let _gate = self.connect_gate.lock().await;
        if let Some(link) = self.current_link()? {
            return Ok(link);
        }

        let retrying = {
            let mut state = self.state.lock();
            let retrying = matches!(*state, LinkState::Backoff);
            *state = LinkState::Connecting;
            retrying
        };

        debug!("connecting to broker");
        let session = match self.connector.connect().await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "broker connection attempt failed");
                self.enter_backoff(retrying);
                return Err(err);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let link = Link {
            channel: session.channel,
            generation,
        };
        let closed = {
            let mut state = self.state.lock();
            if matches!(*state, LinkState::Closed) {
                true
            } else {
                *state = LinkState::Connected(link.clone());
                false
            }
        };
        if closed {
            link.channel.close().await;
            return Err(BrokerError::Closed);
        }

        info!(generation, "broker connected");
        self.watch_link(session.lost, generation);
        self.registry.replay(self, &link).await;
        Ok(link)
    }

    /// Discard the link identified by `generation` and schedule a reconnect.
    /// Stale reports (an older generation, or a link already discarded) are
    /// ignored.
    pub(crate) fn connection_lost(&self, generation: u64, reason: &str) {
        let lost = {
            let mut state = self.state.lock();
            let current = match &*state {
                LinkState::Connected(link) if link.generation == generation => Some(link.clone()),
                _ => None,
            };
            if current.is_some() {
                *state = LinkState::Backoff;
            }
            current
        };
        let Some(link) = lost else {
            return;
        };

        warn!(
            generation,
            reason,
            delay_ms = self.settings.reconnect_delay.as_millis() as u64,
            "broker connection lost; scheduling reconnect"
        );
        tokio::spawn(async move {
            link.channel.close().await;
        });
        self.schedule_reconnect(generation);
    }

    fn enter_backoff(&self, retrying: bool) {
        {
            let mut state = self.state.lock();
            if matches!(*state, LinkState::Closed) {
                return;
            }
            *state = LinkState::Backoff;
        }
        if !retrying {
            self.schedule_reconnect(self.generation());
        }
    }

    fn schedule_reconnect(&self, lost_generation: u64) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let delay = self.settings.reconnect_delay;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                // A newer link took over; whoever loses it schedules the next loop.
                if this.generation() != lost_generation {
                    break;
                }
                match this.phase() {
                    LinkPhase::Connected | LinkPhase::Closed => break,
                    _ => {}
                }
                match this.acquire_link().await {
                    Ok(link) => {
                        info!(generation = link.generation, "broker reconnected");
                        break;
                    }
                    Err(BrokerError::Closed) => break,
                    Err(_) => continue,
                }
            }
        });
    }

    fn watch_link(&self, lost: oneshot::Receiver<String>, generation: u64) {
        let this = self.this.clone();
        tokio::spawn(async move {
            let reason = lost
                .await
                .unwrap_or_else(|_| "connection handle dropped".to_string());
            if let Some(manager) = this.upgrade() {
                manager.connection_lost(generation, &reason);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;

    fn settings(delay_ms: u64) -> ManagerSettings {
        ManagerSettings {
            reconnect_delay: Duration::from_millis(delay_ms),
            ..ManagerSettings::default()
        }
    }

    #[tokio::test]
    async fn acquire_connects_once_and_reuses_the_link() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.connector()), settings(20));
        assert_eq!(manager.phase(), LinkPhase::Idle);

        manager.acquire().await.unwrap();
        manager.acquire().await.unwrap();

        assert_eq!(manager.phase(), LinkPhase::Connected);
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn publish_reports_false_while_broker_is_down() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let manager = ConnectionManager::new(Arc::new(broker.connector()), settings(20));

        assert!(!manager.publish("jobs", &serde_json::json!({"n": 1})).await);
        assert_eq!(manager.phase(), LinkPhase::Backoff);

        broker.set_available(true);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(manager.phase(), LinkPhase::Connected);
        assert!(manager.publish("jobs", &serde_json::json!({"n": 2})).await);
        assert_eq!(broker.queue_depth("jobs"), 1);
    }

    #[tokio::test]
    async fn lost_link_is_replaced_after_the_delay() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.connector()), settings(30));
        manager.acquire().await.unwrap();

        broker.drop_connections();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.phase(), LinkPhase::Backoff);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(manager.phase(), LinkPhase::Connected);
        assert_eq!(manager.generation(), 2);
    }

    #[tokio::test]
    async fn failed_retries_keep_a_single_loop() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.connector()), settings(20));
        manager.acquire().await.unwrap();

        broker.set_available(false);
        broker.drop_connections();
        tokio::time::sleep(Duration::from_millis(110)).await;
        let attempts = broker.connect_attempts();
        // roughly one attempt per delay, never a burst from overlapping loops
        assert!((3..=9).contains(&attempts), "attempts = {attempts}");

        broker.set_available(true);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(manager.phase(), LinkPhase::Connected);
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.connector()), settings(10));
        manager.acquire().await.unwrap();
        manager.close().await;

        assert_eq!(manager.phase(), LinkPhase::Closed);
        assert!(matches!(manager.acquire().await, Err(BrokerError::Closed)));
        assert!(!manager.publish("jobs", "x").await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(broker.connect_count(), 1);
    }
}
