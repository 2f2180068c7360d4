//! Application error types for robust error handling.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid room: {0}")]
    InvalidRoom(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The command targets a voice session that is no longer active.
    #[error("Stale state: {0}")]
    StaleState(String),

    /// The connection is not a member of the room it addressed.
    #[error("Not a member of {0}")]
    NotAMember(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable code sent to clients in `error` replies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Auth(_) => "AUTH_FAILED",
            AppError::StaleState(_) => "STALE_STATE",
            AppError::NotAMember(_) => "NOT_A_MEMBER",
            AppError::Redis(_) | AppError::Db(_) => "STORE_UNAVAILABLE",
            AppError::Serialization(_) | AppError::Validation(_) => "INVALID_COMMAND",
            AppError::InvalidRoom(_) => "INVALID_ROOM",
            AppError::Config(_) | AppError::Internal(_) => "INTERNAL",
        }
    }

    /// True for failures of the shared stores, which callers may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Redis(_) | AppError::Db(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Redis(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Redis error: {}", e),
            ),
            AppError::Db(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Database error: {}", e),
            ),
            AppError::Serialization(e) => (
                StatusCode::BAD_REQUEST,
                format!("Invalid payload: {}", e),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::InvalidRoom(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::StaleState(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::NotAMember(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {}", e),
            ),
        };

        let body = Json(json!({ "error": message, "code": self.code() }));
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_share_one_code() {
        let db = AppError::Db(sqlx::Error::PoolTimedOut);
        assert_eq!(db.code(), "STORE_UNAVAILABLE");
        assert!(db.is_transient());
        assert!(!AppError::StaleState("voice:7".into()).is_transient());
    }

    #[test]
    fn auth_failure_is_unauthorized() {
        let res = AppError::Auth("missing token".into()).into_response();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }
}
