use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::api;
use crate::broker::{amqp::AmqpConnector, memory::MemoryBroker, BrokerConnector, ConnectionManager};
use crate::config::{Config, StoreBackend};
use crate::events::TenantEventBus;
use crate::gateway;
use crate::ingest::{self, WebhookIngestor};
use crate::notifications::{spawn_notification_consumer, NotificationProducer};
use crate::rollup::ConversationAggregator;
use crate::store::{MemoryStore, PgStore, Store};

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub bus: TenantEventBus,
    pub broker: Arc<ConnectionManager>,
    pub aggregator: Arc<ConversationAggregator>,
    pub ingestor: WebhookIngestor,
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        bus: TenantEventBus,
        broker: Arc<ConnectionManager>,
        webhook_secret: Option<String>,
    ) -> Self {
        let aggregator = Arc::new(ConversationAggregator::new(store.clone(), bus.clone()));
        let ingestor = WebhookIngestor::new(store.clone(), aggregator.clone());
        Self {
            store,
            bus,
            broker,
            aggregator,
            ingestor,
            webhook_secret,
        }
    }

    pub fn notification_producer(&self) -> Arc<NotificationProducer> {
        Arc::new(NotificationProducer::new(self.store.clone(), self.bus.clone()))
    }
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "now": Utc::now().to_rfc3339(),
        "broker": {
            "state": state.broker.phase(),
            "generation": state.broker.generation(),
            "queues": state.broker.registered_queues().await,
        },
        "listeners": state.bus.listener_count(),
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/whatsapp", post(ingest::webhook_handler))
        .route("/api/webhook", post(ingest::webhook_handler))
        .route("/api/contacts/{address}/read", post(api::mark_contact_read))
        .route("/api/notifications", get(api::list_notifications))
        .route(
            "/api/notifications/{notification_id}/read",
            patch(api::mark_notification_read),
        )
        .route("/api/events", get(gateway::sse_handler))
        .route("/ws", get(gateway::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    match config.store {
        StoreBackend::Memory => {
            warn!("using the in-memory store; data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let store = PgStore::connect(&config.database_url, 10)
                .await
                .context("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)")?;
            Ok(Arc::new(store))
        }
    }
}

fn broker_connector(config: &Config) -> Arc<dyn BrokerConnector> {
    if config.uses_memory_broker() {
        warn!("using the in-process broker; queued messages are lost on restart");
        Arc::new(MemoryBroker::new().connector())
    } else {
        Arc::new(AmqpConnector::new(config.broker_url.clone()))
    }
}

async fn shutdown_signal(bus: TenantEventBus) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    let streams = bus.disconnect_all();
    info!(streams, "shutdown requested");
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let bus = TenantEventBus::new(config.bus.clone());
    let broker = ConnectionManager::new(broker_connector(&config), config.broker.clone());
    let state = Arc::new(AppState::new(
        store,
        bus,
        broker.clone(),
        config.webhook_secret.clone(),
    ));

    let consumer = spawn_notification_consumer(
        broker.clone(),
        config.notification_queue.clone(),
        state.notification_producer(),
        config.notification_retry_delay,
    );

    let bus = state.bus.clone();
    let app = router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(port = config.port, "chat pipeline listening on http://localhost:{}", config.port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(bus))
        .await
        .context("server runtime failure")?;

    consumer.abort();
    broker.close().await;
    info!("chat pipeline stopped");
    Ok(())
}
