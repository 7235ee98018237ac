//! Tenant-scoped publish/subscribe for dashboard fan-out.
//!
//! Subscribers register on one tenant's channel or on the wildcard channel.
//! Publishing is synchronous and fire-and-forget: each matching subscriber
//! gets a `try_send` into its own bounded queue, a full queue drops the event
//! for that subscriber only, and nothing is kept for subscribers that are not
//! connected.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use futures_util::{stream, Stream};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{StreamScope, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "nova_mensagem")]
    NewMessage,
    #[serde(rename = "contato_atualizado")]
    ContactUpdated,
    #[serde(rename = "notificacao")]
    Notification,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::NewMessage,
        EventKind::ContactUpdated,
        EventKind::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NewMessage => "nova_mensagem",
            EventKind::ContactUpdated => "contato_atualizado",
            EventKind::Notification => "notificacao",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim())
    }
}

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub tenant_id: TenantId,
    pub kind: EventKind,
    pub payload: Value,
}

impl BusEvent {
    /// The wire frame: the payload object with a `type` field added.
    pub fn frame(&self) -> String {
        let frame = match &self.payload {
            Value::Object(fields) => {
                let mut fields = fields.clone();
                fields.insert("type".to_string(), json!(self.kind.as_str()));
                Value::Object(fields)
            }
            other => json!({ "type": self.kind.as_str(), "data": other }),
        };
        frame.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct BusSettings {
    /// Listener count per channel above which a warning is logged.
    pub max_listeners: usize,
    /// Per-subscriber queue length.
    pub buffer: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            max_listeners: 10_000,
            buffer: 256,
        }
    }
}

struct Listener {
    kinds: Vec<EventKind>,
    tx: mpsc::Sender<BusEvent>,
}

struct BusInner {
    channels: RwLock<HashMap<StreamScope, HashMap<u64, Listener>>>,
    next_id: AtomicU64,
    settings: BusSettings,
}

impl BusInner {
    fn remove(&self, scope: StreamScope, id: u64) -> bool {
        let mut channels = self.channels.write();
        let Some(listeners) = channels.get_mut(&scope) else {
            return false;
        };
        let removed = listeners.remove(&id).is_some();
        if listeners.is_empty() {
            channels.remove(&scope);
        }
        removed
    }
}

#[derive(Clone)]
pub struct TenantEventBus {
    inner: Arc<BusInner>,
}

impl Default for TenantEventBus {
    fn default() -> Self {
        Self::new(BusSettings::default())
    }
}

impl TenantEventBus {
    pub fn new(settings: BusSettings) -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                settings,
            }),
        }
    }

    /// Register a listener. An empty `kinds` slice means every kind. The
    /// listener is removed when the returned `Subscription` is dropped.
    pub fn subscribe(&self, scope: StreamScope, kinds: &[EventKind]) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.settings.buffer.max(1));
        let kinds = if kinds.is_empty() {
            EventKind::ALL.to_vec()
        } else {
            kinds.to_vec()
        };

        let count = {
            let mut channels = self.inner.channels.write();
            let listeners = channels.entry(scope).or_default();
            listeners.insert(id, Listener { kinds, tx });
            listeners.len()
        };
        if count > self.inner.settings.max_listeners {
            warn!(
                ?scope,
                count,
                max = self.inner.settings.max_listeners,
                "listener count above limit"
            );
        }
        debug!(?scope, id, "bus subscription opened");

        Subscription {
            id,
            scope,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver to the tenant's channel and the wildcard channel. Returns how
    /// many subscribers accepted the event.
    pub fn publish<T: Serialize + ?Sized>(
        &self,
        tenant_id: TenantId,
        kind: EventKind,
        payload: &T,
    ) -> usize {
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(tenant_id, kind = kind.as_str(), error = %err, "failed to encode bus event");
                return 0;
            }
        };
        let event = BusEvent {
            tenant_id,
            kind,
            payload,
        };

        let channels = self.inner.channels.read();
        let mut delivered = 0;
        for scope in [StreamScope::Tenant(tenant_id), StreamScope::All] {
            let Some(listeners) = channels.get(&scope) else {
                continue;
            };
            for (id, listener) in listeners {
                if !listener.kinds.contains(&kind) {
                    continue;
                }
                match listener.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(tenant_id, subscriber = id, kind = kind.as_str(), "subscriber lagging; event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
        delivered
    }

    /// Drop every listener. Open streams observe their end, which lets
    /// long-lived connections finish during shutdown.
    pub fn disconnect_all(&self) -> usize {
        let mut channels = self.inner.channels.write();
        let count = channels.values().map(HashMap::len).sum();
        channels.clear();
        count
    }

    pub fn listener_count(&self) -> usize {
        self.inner.channels.read().values().map(HashMap::len).sum()
    }
}

/// A live registration on the bus. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    scope: StreamScope,
    rx: mpsc::Receiver<BusEvent>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn scope(&self) -> StreamScope {
        self.scope
    }

    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    pub fn into_stream(self) -> impl Stream<Item = BusEvent> + Send + 'static {
        stream::unfold(self, |mut subscription| async move {
            let event = subscription.recv().await?;
            Some((event, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.scope, self.id);
            debug!(scope = ?self.scope, id = self.id, "bus subscription closed");
        }
    }
}
