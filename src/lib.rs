//! Real-time presence, room membership and voice signaling coordinator.
//!
//! Connections are held by one process; rooms, presence and voice state
//! span every process through a shared fan-out channel, a TTL store and
//! a durable voice-session table.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repositories;
pub mod services;

pub use config::Config;
pub use error::AppError;
pub use handlers::http::AppState;
pub use services::Gateway;

use axum::http::HeaderValue;
use axum::routing::get;
use handlers::http;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// CORS for the upgrade and health routes; `*` allows any origin.
pub fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match origin.trim() {
        "*" | "" => layer.allow_origin(Any),
        other => match HeaderValue::from_str(other) {
            Ok(value) => layer.allow_origin(value),
            Err(_) => {
                tracing::warn!(origin = %other, "invalid CORS origin, allowing any");
                layer.allow_origin(Any)
            }
        },
    }
}

/// Build the router (ws, health). Used by main and by integration tests.
pub fn create_app(state: AppState, ws_path: &str, cors_origin: &str) -> axum::Router {
    axum::Router::new()
        .route(ws_path, get(handlers::ws_handler))
        .route("/health", get(http::health))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origin))
        .with_state(state)
}
