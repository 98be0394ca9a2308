//! WebSocket connection handler

use crate::api::server::AppState;
use crate::types::MarketEvent;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, error, info, warn};

/// WebSocket message from server to client
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsServerMessage {
    Connected { message: String },
    Event(MarketEvent),
    Pong,
}

/// WebSocket message from client to server
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    Ping,
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

fn encode(msg: &WsServerMessage) -> Option<Message> {
    serde_json::to_string(msg).ok().map(Message::Text)
}

/// Stream market events to one client until either side goes away
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    info!("WebSocket client connected");

    let hello = WsServerMessage::Connected {
        message: "Connected to Social Markets".to_string(),
    };
    if let Some(msg) = encode(&hello) {
        if sender.send(msg).await.is_err() {
            return;
        }
    }

    let mut event_rx = state.subscribe();
    // Replies the receive task wants written on the socket
    let (reply_tx, mut reply_rx) = mpsc::channel::<WsServerMessage>(8);

    let send_task = tokio::spawn(async move {
        loop {
            let outgoing = tokio::select! {
                result = event_rx.recv() => match result {
                    Ok(event) => WsServerMessage::Event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("WebSocket client lagged, {} events dropped", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
            };

            if let Some(msg) = encode(&outgoing) {
                if sender.send(msg).await.is_err() {
                    debug!("WebSocket send failed, client disconnected");
                    break;
                }
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => match serde_json::from_str::<WsClientMessage>(&text) {
                    Ok(WsClientMessage::Ping) => {
                        if reply_tx.send(WsServerMessage::Pong).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => debug!("Ignoring unknown WebSocket message"),
                },
                Ok(Message::Close(_)) => {
                    info!("WebSocket client sent close");
                    break;
                }
                Err(e) => {
                    error!("WebSocket receive error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    info!("WebSocket client disconnected");
}
