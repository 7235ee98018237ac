use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::app::AppState;
use crate::store::StoreError;
use crate::types::{StreamScope, TenantId};

pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, message: &str) -> ApiError {
    (status, Json(json!({ "error": message })))
}

fn store_failure(err: StoreError) -> ApiError {
    error!(error = %err, "store request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable")
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

/// Resolve the caller's stream scope from a bearer header or, for clients
/// that cannot set headers (browsers opening a WebSocket or EventSource), a
/// `token` query parameter.
pub async fn session_scope(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<StreamScope, ApiError> {
    let token = bearer_token(headers)
        .or_else(|| query_token.map(|token| token.trim().to_string()))
        .filter(|token| !token.is_empty())
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing bearer token"))?;
    state
        .store
        .resolve_session(&token)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "invalid token"))
}

async fn session_tenant(state: &AppState, headers: &HeaderMap) -> Result<TenantId, ApiError> {
    session_scope(state, headers, None)
        .await?
        .tenant_id()
        .ok_or_else(|| api_error(StatusCode::FORBIDDEN, "tenant session required"))
}

pub async fn mark_contact_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant_id = session_tenant(&state, &headers).await?;
    let rollup = state
        .aggregator
        .mark_read(tenant_id, address.trim())
        .await
        .map_err(store_failure)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "contact not found"))?;
    Ok(Json(rollup))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationQuery {
    #[serde(default)]
    pub unread_only: bool,
}

pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<NotificationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant_id = session_tenant(&state, &headers).await?;
    let notifications = state
        .store
        .list_notifications(tenant_id, query.unread_only)
        .await
        .map_err(store_failure)?;
    Ok(Json(notifications))
}

pub async fn mark_notification_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(notification_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant_id = session_tenant(&state, &headers).await?;
    let found = state
        .store
        .mark_notification_read(tenant_id, notification_id)
        .await
        .map_err(store_failure)?;
    if !found {
        return Err(api_error(StatusCode::NOT_FOUND, "notification not found"));
    }
    Ok(Json(json!({ "ok": true })))
}
