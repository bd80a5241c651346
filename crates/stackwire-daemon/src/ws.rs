//! WebSocket handler for real-time registry updates

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use stackwire_core::ConnectionState;
use stackwire_discovery::{DeviceInfo, RegistryEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// WebSocket message types
#[derive(Serialize)]
#[serde(tag = "type", content = "data")]
enum WsMessage {
    #[serde(rename = "devices")]
    Devices(Vec<DeviceInfo>),
    #[serde(rename = "registry")]
    Registry(RegistryEvent),
    #[serde(rename = "connection")]
    Connection { state: ConnectionState },
    #[serde(rename = "pong")]
    Pong,
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(msg: &WsMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!(error = %e, "Failed to encode WebSocket message");
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut registry_events = state.subscribe();
    let mut connection = state.watch_connection();

    info!("WebSocket client connected");

    // snapshot first, then deltas
    let snapshot = [
        WsMessage::Connection {
            state: *connection.borrow_and_update(),
        },
        WsMessage::Devices(state.devices()),
    ];
    for msg in &snapshot {
        if let Some(msg) = encode(msg) {
            if sender.send(msg).await.is_err() {
                return;
            }
        }
    }

    loop {
        let outgoing = tokio::select! {
            event = registry_events.recv() => match event {
                Ok(event) => WsMessage::Registry(event),
                Err(RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Registry event channel lagged, resending device list");
                    WsMessage::Devices(state.devices())
                }
                Err(RecvError::Closed) => break,
            },

            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                WsMessage::Connection {
                    state: *connection.borrow_and_update(),
                }
            }

            msg = receiver.next() => match msg {
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                    continue;
                }
                // text keepalive
                Some(Ok(Message::Text(text))) if text.as_str() == "ping" => WsMessage::Pong,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
                _ => continue,
            },
        };

        if let Some(msg) = encode(&outgoing) {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    }

    info!("WebSocket client disconnected");
}
