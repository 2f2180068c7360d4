//! HTTP handlers: shared state and health.

use axum::{extract::State, http::StatusCode, Json};
use serde_json::json;
use std::time::Duration;

use crate::services::Gateway;

/// Shared application state for HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    /// Interval between server pings on each socket.
    pub ping_interval: Duration,
    /// Close a socket that has been silent this long.
    pub ping_timeout: Duration,
}

impl AppState {
    pub fn new(gateway: Gateway, ping_interval: Duration, ping_timeout: Duration) -> Self {
        Self {
            gateway,
            ping_interval,
            ping_timeout,
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }
}

/// GET /health: liveness check with process-local counts.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let stats = state.gateway.stats().await;
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": env!("CARGO_PKG_NAME"),
            "instance": state.gateway.instance_id(),
            "connections": stats.connections,
            "users": stats.users,
            "rooms": stats.rooms,
            "voiceSessions": stats.voice_sessions,
        })),
    )
}
