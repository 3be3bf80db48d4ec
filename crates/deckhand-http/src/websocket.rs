//! WebSocket handler for real-time event streaming.
//!
//! Clients connect to `/ws` and receive every bus event as
//! `{ "type": ..., "payload": ... }`. Each message a client sends is answered
//! with an `ack` naming the message type. A `server:shutdown` event is
//! forwarded and then the socket is closed.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use deckhand_core::event_bus::{BroadcastEvent, SERVER_SHUTDOWN};

use crate::state::SharedState;

/// Inbound client message. Only the type is looked at.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    message_type: String,
}

/// Handler for GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

fn ack_for(text: &str) -> Option<BroadcastEvent> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => {
            log::debug!("WebSocket message: {}", message.message_type);
            Some(BroadcastEvent::new(
                "ack",
                json!({ "original": message.message_type }),
            ))
        }
        Err(e) => {
            log::warn!("Failed to parse WebSocket message: {}", e);
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let _client = state.track_ws_client();
    log::info!("WebSocket client connected ({} total)", state.ws_client_count());

    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = state.event_bus.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::channel::<BroadcastEvent>(16);

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Some(ack) = ack_for(text.as_str()) {
                        if reply_tx.send(ack).await.is_err() {
                            break;
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    let send_task = tokio::spawn(async move {
        loop {
            let (event, closing) = tokio::select! {
                received = event_rx.recv() => match received {
                    Ok(event) => {
                        let closing = event.event_type == SERVER_SHUTDOWN;
                        (event, closing)
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        log::warn!("WebSocket client lagged by {} events", count);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(reply) = reply_rx.recv() => (reply, false),
            };

            let Ok(json) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
            if closing {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    });

    tokio::select! {
        _ = recv_task => {},
        _ = send_task => {},
    }

    log::info!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_names_the_original_type() {
        let ack = ack_for(r#"{"type":"ping","payload":{}}"#).unwrap();
        assert_eq!(ack.event_type, "ack");
        assert_eq!(ack.payload, json!({ "original": "ping" }));
    }

    #[test]
    fn ack_serializes_like_every_other_frame() {
        let ack = ack_for(r#"{"type":"hello"}"#).unwrap();
        let frame: serde_json::Value = serde_json::to_value(&ack).unwrap();
        assert_eq!(frame, json!({ "type": "ack", "payload": { "original": "hello" } }));
    }

    #[test]
    fn garbage_gets_no_ack() {
        assert!(ack_for("not json").is_none());
        assert!(ack_for(r#"{"payload":1}"#).is_none());
    }
}
