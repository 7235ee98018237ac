//! Human-attention requests arriving on a durable queue become persisted
//! notifications pushed to the tenant's dashboards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::{BrokerError, ConnectionManager, DeliveryHandler, HandlerError};
use crate::events::{EventKind, TenantEventBus};
use crate::store::Store;
use crate::types::{NotificationView, TenantId};

pub const DEFAULT_QUEUE: &str = "notificacoes_atendimento";
pub const DEFAULT_KIND: &str = "atendimento_humano";

fn flexible_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(number) => number
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom("id out of range")),
        Value::String(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid id {text:?}"))),
        other => Err(serde::de::Error::custom(format!("invalid id {other}"))),
    }
}

/// Queue payload. Producers in the wild use both Portuguese and English keys.
#[derive(Debug, Clone, Deserialize)]
pub struct AttentionRequest {
    #[serde(
        alias = "empresa_id",
        alias = "empresaId",
        alias = "tenantId",
        deserialize_with = "flexible_id"
    )]
    pub tenant_id: TenantId,
    #[serde(
        alias = "cliente_id",
        alias = "clienteId",
        alias = "customer_id",
        alias = "customerId",
        deserialize_with = "flexible_id"
    )]
    pub subject_id: i64,
    #[serde(default, alias = "tipo")]
    pub kind: Option<String>,
    #[serde(default, alias = "mensagem")]
    pub message: Option<String>,
}

pub struct NotificationProducer {
    store: Arc<dyn Store>,
    bus: TenantEventBus,
}

impl NotificationProducer {
    pub fn new(store: Arc<dyn Store>, bus: TenantEventBus) -> Self {
        Self { store, bus }
    }

    pub async fn produce(&self, request: &AttentionRequest) -> Result<NotificationView, HandlerError> {
        let fallback = || format!("Cliente #{}", request.subject_id);
        let subject_name = match self.store.lookup_subject_display(request.subject_id).await {
            Ok(Some(display)) => display.name,
            Ok(None) => fallback(),
            Err(err) => {
                warn!(
                    subject_id = request.subject_id,
                    error = %err,
                    "subject lookup failed; using fallback label"
                );
                fallback()
            }
        };
        let kind = request
            .kind
            .as_deref()
            .map(str::trim)
            .filter(|kind| !kind.is_empty())
            .unwrap_or(DEFAULT_KIND);
        let message = request
            .message
            .as_deref()
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{subject_name} solicitou atendimento humano"));

        let notification = self
            .store
            .insert_notification(request.tenant_id, request.subject_id, kind, &message)
            .await?;
        // the row exists from here on, so it is published even without the joins
        let view = match self.store.notification_view(notification.id).await {
            Ok(Some(view)) => view,
            Ok(None) => NotificationView::bare(notification),
            Err(err) => {
                warn!(
                    notification_id = notification.id,
                    error = %err,
                    "notification re-read failed; publishing without display data"
                );
                NotificationView::bare(notification)
            }
        };

        let delivered = self
            .bus
            .publish(request.tenant_id, EventKind::Notification, &view);
        info!(
            tenant_id = request.tenant_id,
            notification_id = view.notification.id,
            kind,
            delivered,
            "notification created"
        );
        Ok(view)
    }
}

#[async_trait]
impl DeliveryHandler for NotificationProducer {
    async fn handle(&self, payload: Value) -> Result<(), HandlerError> {
        let request = serde_json::from_value::<AttentionRequest>(payload)
            .map_err(|err| HandlerError::InvalidPayload(err.to_string()))?;
        self.produce(&request).await?;
        Ok(())
    }
}

/// Subscribe the producer, retrying on a fixed delay while the broker is
/// unreachable. Once registered, reconnects are the manager's job.
pub fn spawn_notification_consumer(
    manager: Arc<ConnectionManager>,
    queue: String,
    producer: Arc<NotificationProducer>,
    retry_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match manager.subscribe(&queue, producer.clone()).await {
                Ok(()) => {
                    info!(queue = %queue, "notification consumer running");
                    break;
                }
                Err(BrokerError::Closed) => break,
                Err(err) => {
                    warn!(
                        queue = %queue,
                        error = %err,
                        retry_ms = retry_delay.as_millis() as u64,
                        "notification consumer failed to start; retrying"
                    );
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    })
}
