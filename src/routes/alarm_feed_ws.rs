//! Push surface of the alarm feed over WebSocket.
//!
//! `GET /ws/alarm-feed?gatewayId=<id>` upgrades, subscribes, and sends the
//! synced page-1 view as `{"type":"view","view":...}`. After that every
//! [`FeedUpdate`] for the subscription is forwarded as its own JSON message
//! (`pending`, `confirmed`, `unconfirmed`, `removed`). A text frame
//! `refresh` re-syncs page 1 and answers with a new `view` message. The
//! subscription is closed when the socket is.

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::coordinator::{FeedUpdate, FeedView};
use crate::AlarmService;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/ws/alarm-feed", get(ws_handler))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedQuery {
    gateway_id: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<FeedQuery>,
    State((service, _config)): State<AppState>,
) -> impl IntoResponse {
    // ---
    ws.on_upgrade(move |socket| handle_socket(socket, service, params.gateway_id))
}

fn view_message(view: &FeedView) -> serde_json::Result<String> {
    serde_json::to_string(&json!({ "type": "view", "view": view }))
}

fn update_message(update: &FeedUpdate) -> serde_json::Result<String> {
    serde_json::to_string(update)
}

async fn handle_socket(socket: WebSocket, service: Arc<AlarmService>, gateway_id: String) {
    // ---
    let (subscription, view) = match service.open_feed(&gateway_id).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!("Alarm feed for {} not opened: {}", gateway_id, e);
            return;
        }
    };
    let id = subscription.handle.id();
    let mut updates = subscription.updates;
    info!("Alarm feed {} opened for gateway {}", id, gateway_id);

    let (mut sink, mut stream) = socket.split();

    // views requested by the client, plus the initial one
    let (view_tx, mut view_rx) = mpsc::unbounded_channel::<FeedView>();
    let _ = view_tx.send(view);

    let sender_service = service.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                view = view_rx.recv() => match view {
                    Some(view) => view_message(&view),
                    None => break,
                },
                update = updates.recv() => match update {
                    Ok(update) => update_message(&update),
                    Err(RecvError::Lagged(skipped)) => {
                        // missed updates; resend the whole page instead
                        debug!("Alarm feed {} lagged by {} updates", id, skipped);
                        match sender_service.feed_page(id, 1).await {
                            Ok(view) => view_message(&view),
                            Err(_) => break,
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            let Ok(text) = text else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                debug!("Alarm feed {} sink closed", id);
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) if text.as_str().trim() == "refresh" => {
                match service.refresh_feed(id).await {
                    Ok(view) => {
                        let _ = view_tx.send(view);
                    }
                    Err(e) => warn!("Alarm feed {} refresh failed: {}", id, e),
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Alarm feed {} receive error: {}", id, e);
                break;
            }
        }
    }

    let _ = service.close_feed(id).await;
    send_task.abort();
    info!("Alarm feed {} closed", id);
}
