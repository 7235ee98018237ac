//! Long-lived dashboard connections. Each connection owns one bus
//! subscription for its session's scope; the subscription is dropped, and so
//! deregistered, whenever the connection task ends.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Response,
    },
};
use futures_util::{sink::SinkExt, stream::StreamExt, Stream};
use serde::Deserialize;
use tracing::{debug, info};

use crate::api::{api_error, session_scope, ApiError};
use crate::app::AppState;
use crate::events::{EventKind, Subscription};

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub token: Option<String>,
    /// Comma-separated event kinds; empty means all.
    pub kinds: Option<String>,
}

impl StreamQuery {
    /// Unknown names are skipped, but a filter naming only unknown kinds is
    /// rejected rather than widened to every kind.
    pub fn kinds(&self) -> Result<Vec<EventKind>, ApiError> {
        let names: Vec<&str> = self
            .kinds
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect();
        let kinds: Vec<EventKind> = names.iter().copied().filter_map(EventKind::parse).collect();
        if kinds.is_empty() && !names.is_empty() {
            return Err(api_error(StatusCode::BAD_REQUEST, "unknown event kinds"));
        }
        Ok(kinds)
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let scope = session_scope(&state, &headers, query.token.as_deref()).await?;
    let kinds = query.kinds()?;
    Ok(ws.on_upgrade(move |socket| {
        let subscription = state.bus.subscribe(scope, &kinds);
        handle_socket(socket, subscription)
    }))
}

async fn handle_socket(socket: WebSocket, mut subscription: Subscription) {
    let scope = subscription.scope();
    info!(?scope, "dashboard socket connected");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if sender.send(Message::Text(event.frame().into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // the stream is push-only
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    drop(subscription);
    debug!(?scope, "dashboard socket closed");
}

pub async fn sse_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let scope = session_scope(&state, &headers, query.token.as_deref()).await?;
    let kinds = query.kinds()?;
    let subscription = state.bus.subscribe(scope, &kinds);
    info!(?scope, "dashboard event stream opened");

    let events = subscription.into_stream().map(|event| {
        Ok(Event::default()
            .event(event.kind.as_str())
            .data(event.frame()))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_filter_skips_unknown_names() {
        let query = StreamQuery {
            token: None,
            kinds: Some("notificacao, nova_mensagem,bogus".to_string()),
        };
        assert_eq!(
            query.kinds().unwrap(),
            vec![EventKind::Notification, EventKind::NewMessage]
        );
        assert!(StreamQuery::default().kinds().unwrap().is_empty());
        let blank = StreamQuery {
            token: None,
            kinds: Some(" , ".to_string()),
        };
        assert!(blank.kinds().unwrap().is_empty());
    }

    #[test]
    fn kinds_filter_of_only_unknown_names_is_rejected() {
        let query = StreamQuery {
            token: None,
            kinds: Some("bogus,also_bogus".to_string()),
        };
        let (status, body) = query.kinds().unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.0["error"], "unknown event kinds");
    }
}
