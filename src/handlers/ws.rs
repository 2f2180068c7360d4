//! WebSocket handler: handshake, command loop, keepalive and disconnect cleanup.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::handlers::http::AppState;
use crate::middleware::Handshake;
use crate::models::{ClientCommand, Identity, ServerEvent};

/// Upgrade HTTP to WebSocket. The handshake is checked before the upgrade,
/// so a refused client never reaches the registry.
pub async fn ws_handler(
    State(state): State<AppState>,
    handshake: Handshake,
    ws: WebSocketUpgrade,
) -> Response {
    debug!(user_id = %handshake.identity.user_id, "upgrade accepted");
    ws.on_upgrade(move |socket| handle_socket(state, socket, handshake.identity))
}

async fn handle_socket(state: AppState, socket: WebSocket, identity: Identity) {
    let user_id = identity.user_id.clone();
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn_id = match state.gateway().connect(identity, tx).await {
        Ok(id) => id,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "connect failed");
            let reply = ServerEvent::Error {
                code: e.code().to_string(),
                message: e.to_string(),
                command: None,
            };
            if let Ok(text) = reply.to_json() {
                let _ = sender.send(Message::Text(text)).await;
            }
            let _ = sender.close().await;
            return;
        }
    };
    info!(conn_id = %conn_id, user_id = %user_id, "ws connected");

    let ping_interval = state.ping_interval;
    let send_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sender.close().await;
    });

    loop {
        let msg = match tokio::time::timeout(state.ping_timeout, receiver.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!(conn_id = %conn_id, error = %e, "ws read error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(conn_id = %conn_id, timeout = ?state.ping_timeout, "ws idle timeout");
                break;
            }
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => state.gateway().dispatch(&conn_id, &user_id, command).await,
                Err(e) => {
                    let err = AppError::Validation(format!("unrecognised command: {}", e));
                    state.gateway().reject(&conn_id, &err, None).await;
                }
            },
            Message::Close(_) => break,
            // pings, pongs and binary frames only count as activity
            _ => {}
        }
    }

    state.gateway().disconnect(&conn_id).await;
    send_task.abort();
    info!(conn_id = %conn_id, "ws disconnected");
}
