use std::sync::Arc;

use tracing::{debug, warn};

use crate::events::{EventKind, TenantEventBus};
use crate::store::{Store, StoreError};
use crate::types::{ContactRollup, RollupUpdate, StoredMessage, TenantId};

/// Maintains the per-(tenant, address) contact summary and announces stored
/// messages and rollup changes on the event bus.
pub struct ConversationAggregator {
    store: Arc<dyn Store>,
    bus: TenantEventBus,
}

impl ConversationAggregator {
    pub fn new(store: Arc<dyn Store>, bus: TenantEventBus) -> Self {
        Self { store, bus }
    }

    /// Fold a stored message into its contact rollup. A rollup failure is
    /// logged and leaves the message write in place; the message itself is
    /// still announced.
    pub async fn apply(&self, message: &StoredMessage) -> Option<ContactRollup> {
        let update = RollupUpdate::from_message(message);
        let rollup = match self
            .store
            .upsert_contact_rollup(message.tenant_id, &message.address, &update)
            .await
        {
            Ok(rollup) => Some(rollup),
            Err(err) => {
                warn!(
                    tenant_id = message.tenant_id,
                    address = %message.address,
                    error = %err,
                    "contact rollup update failed"
                );
                None
            }
        };

        self.bus
            .publish(message.tenant_id, EventKind::NewMessage, message);
        if let Some(rollup) = &rollup {
            let delivered = self
                .bus
                .publish(rollup.tenant_id, EventKind::ContactUpdated, rollup);
            debug!(
                tenant_id = rollup.tenant_id,
                address = %rollup.address,
                unread = rollup.unread_count,
                delivered,
                "contact rollup updated"
            );
        }
        rollup
    }

    /// Reset unread for a contact. `None` when the contact has no rollup yet.
    pub async fn mark_read(
        &self,
        tenant_id: TenantId,
        address: &str,
    ) -> Result<Option<ContactRollup>, StoreError> {
        let rollup = self.store.mark_contact_read(tenant_id, address).await?;
        if let Some(rollup) = &rollup {
            self.bus
                .publish(tenant_id, EventKind::ContactUpdated, rollup);
        }
        Ok(rollup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{InboundMessage, MessageKind, StreamScope};
    use serde_json::json;

    fn inbound(id: &str, text: &str, from_me: bool) -> InboundMessage {
        InboundMessage {
            tenant_id: 7,
            address: "5511999998888".to_string(),
            provider_message_id: id.to_string(),
            from_me,
            sender_name: Some("Maria".to_string()),
            kind: MessageKind::Text,
            text: Some(text.to_string()),
            timestamp: 1_700_000_000,
            status: None,
            media: None,
            raw: json!({}),
        }
    }

    #[tokio::test]
    async fn unread_counts_received_and_resets_on_reply() {
        let store = Arc::new(MemoryStore::new());
        let bus = TenantEventBus::default();
        let aggregator = ConversationAggregator::new(store.clone(), bus.clone());

        for (id, text) in [("m1", "oi"), ("m2", "tudo bem?")] {
            let stored = store.upsert_message(&inbound(id, text, false)).await.unwrap();
            aggregator.apply(&stored).await.unwrap();
        }
        let rollup = store.contact(7, "5511999998888").unwrap();
        assert_eq!(rollup.unread_count, 2);
        assert_eq!(rollup.display_name.as_deref(), Some("Maria"));

        let reply = store.upsert_message(&inbound("m3", "ok", true)).await.unwrap();
        let rollup = aggregator.apply(&reply).await.unwrap();
        assert_eq!(rollup.unread_count, 0);
        assert!(rollup.last_from_me);
        assert_eq!(rollup.last_message.as_deref(), Some("ok"));
        assert_eq!(rollup.display_name.as_deref(), Some("Maria"));
    }

    #[tokio::test]
    async fn apply_announces_message_then_rollup() {
        let store = Arc::new(MemoryStore::new());
        let bus = TenantEventBus::default();
        let mut events = bus.subscribe(StreamScope::Tenant(7), &[]);
        let aggregator = ConversationAggregator::new(store.clone(), bus.clone());

        let stored = store.upsert_message(&inbound("m1", "oi", false)).await.unwrap();
        aggregator.apply(&stored).await;

        let first = events.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::NewMessage);
        assert_eq!(first.payload["text"], "oi");
        let second = events.recv().await.unwrap();
        assert_eq!(second.kind, EventKind::ContactUpdated);
        assert_eq!(second.payload["unreadCount"], 1);
    }

    #[tokio::test]
    async fn rollup_failure_keeps_the_message_and_still_announces_it() {
        let store = Arc::new(MemoryStore::new());
        store.set_rollups_unavailable(true);
        let bus = TenantEventBus::default();
        let mut events = bus.subscribe(StreamScope::Tenant(7), &[]);
        let aggregator = ConversationAggregator::new(store.clone(), bus);

        let stored = store.upsert_message(&inbound("m1", "oi", false)).await.unwrap();
        assert!(aggregator.apply(&stored).await.is_none());

        assert_eq!(store.messages().len(), 1);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::NewMessage);
    }

    #[tokio::test]
    async fn mark_read_resets_unread() {
        let store = Arc::new(MemoryStore::new());
        let aggregator = ConversationAggregator::new(store.clone(), TenantEventBus::default());
        let stored = store.upsert_message(&inbound("m1", "oi", false)).await.unwrap();
        aggregator.apply(&stored).await;

        let rollup = aggregator.mark_read(7, "5511999998888").await.unwrap().unwrap();
        assert_eq!(rollup.unread_count, 0);
        assert!(aggregator.mark_read(7, "0000").await.unwrap().is_none());
    }
}
