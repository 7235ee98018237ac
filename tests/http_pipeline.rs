use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chat_pipeline::app::{router, AppState};
use chat_pipeline::broker::{memory::MemoryBroker, ConnectionManager, ManagerSettings};
use chat_pipeline::events::TenantEventBus;
use chat_pipeline::notifications::spawn_notification_consumer;
use chat_pipeline::store::MemoryStore;
use chat_pipeline::types::StreamScope;
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sha2::Sha256;
use tower::ServiceExt;

struct Harness {
    store: Arc<MemoryStore>,
    broker: MemoryBroker,
    state: Arc<AppState>,
    app: Router,
}

fn harness_with_secret(secret: Option<&str>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.add_tenant(7, "Loja Centro");
    store.add_tenant(8, "Loja Norte");
    store.add_subject(42, "Maria Souza", Some("5511999998888"));
    store.add_session("token-7", StreamScope::Tenant(7));
    store.add_session("token-8", StreamScope::Tenant(8));
    store.add_session("token-admin", StreamScope::All);

    let broker = MemoryBroker::new();
    let manager = ConnectionManager::new(
        Arc::new(broker.connector()),
        ManagerSettings {
            reconnect_delay: Duration::from_millis(20),
            ..ManagerSettings::default()
        },
    );
    let state = Arc::new(AppState::new(
        store.clone(),
        TenantEventBus::default(),
        manager,
        secret.map(str::to_string),
    ));
    let app = router(state.clone());
    Harness {
        store,
        broker,
        state,
        app,
    }
}

fn harness() -> Harness {
    harness_with_secret(None)
}

fn message_record(id: &str, text: &str, from_me: bool) -> Value {
    let push_name = if from_me { "Atendente" } else { "Maria" };
    json!({
        "key": {"remoteJid": "5511999998888@s.whatsapp.net", "fromMe": from_me, "id": id},
        "pushName": push_name,
        "messageTimestamp": 1700000000,
        "message": {"conversation": text}
    })
}

fn webhook(instance: &str, data: Value) -> Value {
    json!({"event": "messages.upsert", "instance": instance, "data": data})
}

async fn post_json(app: &Router, uri: &str, body: &Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

/// Reads `data:` payloads off a server-sent-events body.
struct SseReader {
    body: Body,
    pending: VecDeque<Value>,
}

impl SseReader {
    async fn open(app: &Router, uri: &str) -> Self {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        Self {
            body: response.into_body(),
            pending: VecDeque::new(),
        }
    }

    async fn next(&mut self, wait: Duration) -> Option<Value> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let frame = tokio::time::timeout(wait, self.body.frame())
                .await
                .ok()??
                .ok()?;
            let Ok(data) = frame.into_data() else {
                continue;
            };
            let text = String::from_utf8_lossy(&data);
            for line in text.lines() {
                if let Some(payload) = line.strip_prefix("data:") {
                    if let Ok(value) = serde_json::from_str(payload.trim_start()) {
                        self.pending.push_back(value);
                    }
                }
            }
        }
    }
}

#[tokio::test]
async fn received_then_replied_then_redelivered() {
    let h = harness();

    let (status, body) = post_json(
        &h.app,
        "/webhook/whatsapp",
        &webhook("7 - Loja Centro", message_record("M1", "oi", false)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true, "processed": 1}));
    assert_eq!(h.store.contact(7, "5511999998888").unwrap().unread_count, 1);

    post_json(
        &h.app,
        "/webhook/whatsapp",
        &webhook("7 - Loja Centro", message_record("M2", "ok", true)),
    )
    .await;
    let rollup = h.store.contact(7, "5511999998888").unwrap();
    assert_eq!(rollup.unread_count, 0);
    assert_eq!(rollup.last_message.as_deref(), Some("ok"));
    assert!(rollup.last_from_me);
    assert_eq!(rollup.display_name.as_deref(), Some("Maria"));

    post_json(
        &h.app,
        "/api/webhook",
        &webhook("7 - Loja Centro", message_record("M1", "oi", false)),
    )
    .await;
    assert_eq!(h.store.messages().len(), 2);
    assert_eq!(h.store.contact(7, "5511999998888").unwrap().unread_count, 0);
}

#[tokio::test]
async fn one_failing_record_does_not_sink_the_batch() {
    let h = harness();
    h.store.reject_message("BAD");

    let data = json!([
        message_record("A1", "primeira", false),
        message_record("BAD", "quebrada", false),
        message_record("A3", "terceira", false),
    ]);
    let (status, body) = post_json(&h.app, "/webhook/whatsapp", &webhook("7", data)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 2);
    assert_eq!(h.store.messages().len(), 2);
    assert_eq!(h.store.contact(7, "5511999998888").unwrap().unread_count, 2);
}

#[tokio::test]
async fn ignored_inputs_answer_200_with_a_reason() {
    let h = harness();

    let (status, body) = post_json(&h.app, "/webhook/whatsapp", &json!({"hello": "world"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["skipped"], true);
    assert_eq!(body["reason"], "invalid_payload");

    let group = json!({
        "key": {"remoteJid": "120363@g.us", "id": "G1"},
        "message": {"conversation": "grupo"}
    });
    let (_, body) = post_json(&h.app, "/webhook/whatsapp", &webhook("7", group)).await;
    assert_eq!(body["processed"], 0);

    let (_, body) = post_json(
        &h.app,
        "/webhook/whatsapp",
        &webhook("sem tenant", message_record("X", "oi", false)),
    )
    .await;
    assert_eq!(body["reason"], "invalid_instance");
    assert!(h.store.messages().is_empty());
}

#[tokio::test]
async fn store_outage_on_tenant_lookup_is_a_500() {
    let h = harness();
    h.store.set_unavailable(true);
    let (status, body) = post_json(
        &h.app,
        "/webhook/whatsapp",
        &webhook("7", message_record("M1", "oi", false)),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["ok"], false);
}

#[tokio::test]
async fn signed_webhooks_require_a_valid_signature() {
    let h = harness_with_secret(Some("s3cret"));
    let payload = webhook("7", message_record("M1", "oi", false)).to_string();

    let (status, _) = post_json(&h.app, "/webhook/whatsapp", &serde_json::from_str(&payload).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut mac = Hmac::<Sha256>::new_from_slice(b"s3cret").unwrap();
    mac.update(payload.as_bytes());
    let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
    let request = Request::builder()
        .method("POST")
        .uri("/webhook/whatsapp")
        .header("content-type", "application/json")
        .header("x-hub-signature-256", signature)
        .body(Body::from(payload))
        .unwrap();
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 1);
}

#[tokio::test]
async fn event_streams_are_tenant_isolated() {
    let h = harness();
    let mut tenant_7 = SseReader::open(&h.app, "/api/events?token=token-7").await;
    let mut tenant_8 = SseReader::open(&h.app, "/api/events?token=token-8").await;
    let mut admin = SseReader::open(&h.app, "/api/events?token=token-admin&kinds=nova_mensagem").await;
    assert_eq!(h.state.bus.listener_count(), 3);

    post_json(
        &h.app,
        "/webhook/whatsapp",
        &webhook("7 - Loja Centro", message_record("M1", "oi", false)),
    )
    .await;

    let wait = Duration::from_millis(500);
    let first = tenant_7.next(wait).await.unwrap();
    assert_eq!(first["type"], "nova_mensagem");
    assert_eq!(first["text"], "oi");
    let second = tenant_7.next(wait).await.unwrap();
    assert_eq!(second["type"], "contato_atualizado");
    assert_eq!(second["unreadCount"], 1);

    let observed = admin.next(wait).await.unwrap();
    assert_eq!(observed["type"], "nova_mensagem");
    assert_eq!(observed["tenantId"], 7);

    assert!(tenant_8.next(Duration::from_millis(100)).await.is_none());

    drop(tenant_7);
    drop(tenant_8);
    drop(admin);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.state.bus.listener_count(), 0);
}

#[tokio::test]
async fn streams_require_a_known_session() {
    let h = harness();
    let request = Request::builder().uri("/api/events").body(Body::empty()).unwrap();
    let (status, _) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/events?token=nope")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn stream_filter_naming_only_unknown_kinds_is_rejected() {
    let h = harness();
    let request = Request::builder()
        .uri("/api/events?token=token-7&kinds=bogus")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unknown event kinds");
    assert_eq!(h.state.bus.listener_count(), 0);

    // the session check still comes first
    let request = Request::builder()
        .uri("/api/events?token=nope&kinds=bogus")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&h.app, request).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn queued_attention_request_reaches_dashboard_and_api() {
    let h = harness();
    let mut stream = SseReader::open(&h.app, "/api/events?token=token-7").await;
    spawn_notification_consumer(
        h.state.broker.clone(),
        "notificacoes_atendimento".to_string(),
        h.state.notification_producer(),
        Duration::from_millis(20),
    );

    let body = json!({"empresa_id": 7, "cliente_id": 42, "mensagem": "Quer falar com alguém"});
    h.broker
        .publish_raw("notificacoes_atendimento", body.to_string().as_bytes());

    let event = stream.next(Duration::from_secs(1)).await.unwrap();
    assert_eq!(event["type"], "notificacao");
    assert_eq!(event["message"], "Quer falar com alguém");
    assert_eq!(event["subjectName"], "Maria Souza");
    let notification_id = event["id"].as_i64().unwrap();

    let list = Request::builder()
        .uri("/api/notifications?unreadOnly=true")
        .header("authorization", "Bearer token-7")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h.app, list).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let mark = Request::builder()
        .method("PATCH")
        .uri(format!("/api/notifications/{notification_id}/read"))
        .header("authorization", "Bearer token-7")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&h.app, mark).await.0, StatusCode::OK);

    let other_tenant = Request::builder()
        .method("PATCH")
        .uri(format!("/api/notifications/{notification_id}/read"))
        .header("authorization", "Bearer token-8")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&h.app, other_tenant).await.0, StatusCode::NOT_FOUND);

    let list = Request::builder()
        .uri("/api/notifications?unreadOnly=true")
        .header("authorization", "Bearer token-7")
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&h.app, list).await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn consumer_started_during_an_outage_subscribes_once_the_broker_returns() {
    let h = harness();
    h.broker.set_available(false);
    let mut stream = SseReader::open(&h.app, "/api/events?token=token-7").await;
    let consumer = spawn_notification_consumer(
        h.state.broker.clone(),
        "notificacoes_atendimento".to_string(),
        h.state.notification_producer(),
        Duration::from_millis(20),
    );

    let body = json!({"empresa_id": 7, "cliente_id": 42});
    h.broker
        .publish_raw("notificacoes_atendimento", body.to_string().as_bytes());
    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(h.broker.connect_attempts() >= 2);
    assert_eq!(h.broker.connect_count(), 0);
    assert!(!consumer.is_finished());
    assert_eq!(h.store.notifications().len(), 0);

    h.broker.set_available(true);
    let event = stream.next(Duration::from_secs(1)).await.unwrap();
    assert_eq!(event["type"], "notificacao");
    assert_eq!(event["message"], "Maria Souza solicitou atendimento humano");
    assert_eq!(h.store.notifications().len(), 1);

    tokio::time::timeout(Duration::from_secs(1), consumer)
        .await
        .expect("consumer loop should stop once subscribed")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.broker.queue_depth("notificacoes_atendimento"), 0);
    assert_eq!(h.broker.unacked_count(), 0);
}

#[tokio::test]
async fn mark_contact_read_resets_unread() {
    let h = harness();
    post_json(
        &h.app,
        "/webhook/whatsapp",
        &webhook("7", message_record("M1", "oi", false)),
    )
    .await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/contacts/5511999998888/read")
        .header("authorization", "Bearer token-7")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["unreadCount"], 0);

    let admin = Request::builder()
        .method("POST")
        .uri("/api/contacts/5511999998888/read")
        .header("authorization", "Bearer token-admin")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&h.app, admin).await.0, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn ingestion_keeps_working_while_the_broker_is_down() {
    let h = harness();
    h.broker.set_available(false);

    let (status, body) = post_json(
        &h.app,
        "/webhook/whatsapp",
        &webhook("7", message_record("M1", "oi", false)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 1);

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["broker"]["state"], "idle");
}
