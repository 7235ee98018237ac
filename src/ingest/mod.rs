//! Provider webhook ingestion.
//!
//! A callback is `{event, instance, data}`. The tenant comes from the instance
//! name, `data` holds one or many records, and each record is written with an
//! idempotent upsert before being folded into its contact rollup. Records are
//! isolated from each other: one failing write is logged and the rest go on.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::rollup::ConversationAggregator;
use crate::store::{Store, StoreError};
use crate::types::{InboundMessage, TenantId};

pub mod payload;

use payload::{ProviderEvent, ProviderRecord, RecordSkip};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WebhookResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookResult {
    fn processed(count: usize) -> Self {
        Self {
            ok: true,
            processed: Some(count),
            ..Self::default()
        }
    }

    fn skipped(reason: &str) -> Self {
        Self {
            ok: true,
            skipped: Some(true),
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }

    fn failed(error: &str) -> Self {
        Self {
            ok: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

enum RecordOutcome {
    Stored,
    StatusUpdated,
    Ignored(&'static str),
}

pub struct WebhookIngestor {
    store: Arc<dyn Store>,
    aggregator: Arc<ConversationAggregator>,
}

impl WebhookIngestor {
    pub fn new(store: Arc<dyn Store>, aggregator: Arc<ConversationAggregator>) -> Self {
        Self { store, aggregator }
    }

    /// Process one callback. Only a failure to resolve the tenant surfaces as
    /// an error; per-record failures are logged and counted out.
    pub async fn ingest(&self, body: &Value) -> Result<WebhookResult, IngestError> {
        let event = body.get("event").and_then(Value::as_str);
        let instance = body.get("instance").and_then(Value::as_str);
        let data = body.get("data").filter(|data| data.is_object() || data.is_array());
        let (Some(event), Some(instance), Some(data)) = (event, instance, data) else {
            debug!("webhook without event/instance/data");
            return Ok(WebhookResult::skipped("invalid_payload"));
        };

        let Some(event) = ProviderEvent::parse(event) else {
            debug!(event, "unsupported webhook event");
            return Ok(WebhookResult::skipped("unsupported_event"));
        };
        let Some(tenant_id) = payload::parse_tenant_id(instance) else {
            warn!(instance, "webhook instance carries no tenant id");
            return Ok(WebhookResult::skipped("invalid_instance"));
        };
        if !self.store.tenant_exists(tenant_id).await? {
            warn!(tenant_id, instance, "webhook for unknown tenant");
            return Ok(WebhookResult::skipped("unknown_tenant"));
        }

        let records = payload::records(data);
        let mut processed = 0;
        for record in &records {
            match self.ingest_record(tenant_id, event, record).await {
                Ok(RecordOutcome::Stored) | Ok(RecordOutcome::StatusUpdated) => processed += 1,
                Ok(RecordOutcome::Ignored(reason)) => {
                    debug!(tenant_id, reason, "webhook record ignored");
                }
                Err(err) => {
                    error!(tenant_id, error = %err, "webhook record failed");
                }
            }
        }
        info!(tenant_id, total = records.len(), processed, "webhook processed");
        Ok(WebhookResult::processed(processed))
    }

    async fn ingest_record(
        &self,
        tenant_id: TenantId,
        event: ProviderEvent,
        record: &Value,
    ) -> Result<RecordOutcome, StoreError> {
        let parsed = match ProviderRecord::parse(record) {
            Ok(parsed) => parsed,
            Err(skip) => return Ok(RecordOutcome::Ignored(skip.as_str())),
        };

        let Some(content) = parsed.content.clone() else {
            if event != ProviderEvent::MessageUpdate {
                return Ok(RecordOutcome::Ignored(RecordSkip::NoContent.as_str()));
            }
            let Some(status) = parsed.status.as_deref() else {
                return Ok(RecordOutcome::Ignored(RecordSkip::NoContent.as_str()));
            };
            let updated = self
                .store
                .update_message_status(tenant_id, &parsed.provider_message_id, status)
                .await?;
            return Ok(match updated {
                Some(_) => RecordOutcome::StatusUpdated,
                None => RecordOutcome::Ignored("unknown_message"),
            });
        };
        if content.is_ignored() {
            return Ok(RecordOutcome::Ignored(RecordSkip::IgnoredContent.as_str()));
        }

        let (text, media) = content.render();
        let message = InboundMessage {
            tenant_id,
            address: parsed.address,
            provider_message_id: parsed.provider_message_id,
            from_me: parsed.from_me || event == ProviderEvent::MessageSent,
            sender_name: parsed.push_name,
            kind: content.kind(),
            text,
            timestamp: parsed.timestamp,
            status: parsed.status,
            media,
            raw: record.clone(),
        };
        let stored = self.store.upsert_message(&message).await?;
        if !stored.inserted {
            debug!(
                tenant_id,
                provider_message_id = %stored.provider_message_id,
                "provider redelivery merged into existing message"
            );
        }
        self.aggregator.apply(&stored).await;
        Ok(RecordOutcome::Stored)
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Check `x-hub-signature-256: sha256=<hex>` against the raw body. An empty
/// secret disables the check.
pub fn verify_signature(secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let secret = state.webhook_secret.as_deref().unwrap_or("");
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|value| value.to_str().ok());
    if !verify_signature(secret, signature_header, &body) {
        warn!("webhook rejected: invalid signature");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "error": "invalid webhook signature" })),
        )
            .into_response();
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        debug!("webhook body is not json");
        return Json(WebhookResult::skipped("invalid_json")).into_response();
    };

    match state.ingestor.ingest(&payload).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => {
            error!(error = %err, "webhook ingestion failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(WebhookResult::failed(&err.to_string())),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TenantEventBus;
    use crate::store::MemoryStore;

    fn ingestor() -> (Arc<MemoryStore>, WebhookIngestor) {
        let store = Arc::new(MemoryStore::new());
        store.add_tenant(7, "Loja Centro");
        let aggregator = Arc::new(ConversationAggregator::new(
            store.clone(),
            TenantEventBus::default(),
        ));
        (store.clone(), WebhookIngestor::new(store, aggregator))
    }

    fn upsert(id: &str, text: &str, from_me: bool) -> Value {
        json!({
            "event": "messages.upsert",
            "instance": "7 - Loja Centro",
            "data": {
                "key": {"remoteJid": "5511999998888@s.whatsapp.net", "fromMe": from_me, "id": id},
                "pushName": "Maria",
                "messageTimestamp": 1700000000,
                "message": {"conversation": text}
            }
        })
    }

    #[test]
    fn signature_check_matches_the_raw_body() {
        let body = br#"{"event":"x"}"#;
        let mut mac = HmacSha256::new_from_slice(b"s3cret").unwrap();
        mac.update(body);
        let header = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_signature("s3cret", Some(&header), body));
        assert!(!verify_signature("s3cret", Some(&header), b"{}"));
        assert!(!verify_signature("s3cret", None, body));
        assert!(verify_signature("", None, body));
    }

    #[tokio::test]
    async fn duplicate_delivery_keeps_one_row() {
        let (store, ingestor) = ingestor();
        let first = ingestor.ingest(&upsert("ABC", "oi", false)).await.unwrap();
        assert_eq!(first.processed, Some(1));
        ingestor.ingest(&upsert("ABC", "oi", false)).await.unwrap();

        assert_eq!(store.messages().len(), 1);
        assert_eq!(store.contact(7, "5511999998888").unwrap().unread_count, 1);
    }

    #[tokio::test]
    async fn skips_are_reported_with_a_reason() {
        let (_store, ingestor) = ingestor();
        let cases = [
            (json!({"instance": "7"}), "invalid_payload"),
            (
                json!({"event": "connection.update", "instance": "7", "data": {}}),
                "unsupported_event",
            ),
            (
                json!({"event": "messages.upsert", "instance": "Loja", "data": {}}),
                "invalid_instance",
            ),
            (
                json!({"event": "messages.upsert", "instance": "99 - Outra", "data": {}}),
                "unknown_tenant",
            ),
        ];
        for (body, reason) in cases {
            let result = ingestor.ingest(&body).await.unwrap();
            assert_eq!(result.skipped, Some(true));
            assert_eq!(result.reason.as_deref(), Some(reason));
        }
    }

    #[tokio::test]
    async fn status_update_touches_only_existing_messages() {
        let (store, ingestor) = ingestor();
        ingestor.ingest(&upsert("ABC", "oi", true)).await.unwrap();

        let update = json!({
            "event": "MESSAGES_UPDATE",
            "instance": "7 - Loja Centro",
            "data": [
                {"remoteJid": "5511999998888@s.whatsapp.net", "keyId": "ABC", "fromMe": true, "status": 4},
                {"remoteJid": "5511999998888@s.whatsapp.net", "keyId": "NOPE", "status": "READ"}
            ]
        });
        let result = ingestor.ingest(&update).await.unwrap();
        assert_eq!(result.processed, Some(1));

        let messages = store.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status.as_deref(), Some("READ"));
        assert_eq!(messages[0].text.as_deref(), Some("oi"));
    }

    #[tokio::test]
    async fn tenant_lookup_failure_is_an_error() {
        let (store, ingestor) = ingestor();
        store.set_unavailable(true);
        assert!(ingestor.ingest(&upsert("ABC", "oi", false)).await.is_err());
    }
}
