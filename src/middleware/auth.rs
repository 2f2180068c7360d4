//! Handshake extractor: identity asserted by the client at WebSocket upgrade.
//!
//! Token verification is done upstream; here the token only has to be
//! present. A missing token or user id refuses the upgrade with 401.

use axum::{
    extract::{FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use std::collections::HashMap;
use tracing::debug;

use crate::error::AppError;
use crate::models::Identity;

const BEARER_PREFIX: &str = "Bearer ";
const HEADER_USER_ID: &str = "x-user-id";
const HEADER_USERNAME: &str = "x-username";
const DEFAULT_DISPLAY_NAME: &str = "Anonymous";

/// Identity carried by an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub token: String,
    pub identity: Identity,
}

impl Handshake {
    /// Read `token`/`userId`/`username` from the query string, falling back
    /// to `Authorization: Bearer`, `x-user-id` and `x-username`.
    pub fn from_parts(
        query: &HashMap<String, String>,
        headers: &HeaderMap,
    ) -> Result<Self, AppError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };
        let param = |name: &str| {
            query
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(String::from)
        };

        let token = param("token")
            .or_else(|| {
                header(AUTHORIZATION.as_str())
                    .and_then(|v| v.strip_prefix(BEARER_PREFIX).map(str::trim).map(String::from))
                    .filter(|v| !v.is_empty())
            })
            .ok_or_else(|| AppError::Auth("missing token".to_string()))?;
        let user_id = param("userId")
            .or_else(|| header(HEADER_USER_ID))
            .ok_or_else(|| AppError::Auth("missing user id".to_string()))?;
        let display_name = param("username")
            .or_else(|| header(HEADER_USERNAME))
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string());

        Ok(Self {
            token,
            identity: Identity::new(user_id, display_name),
        })
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Handshake
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Query(query) = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .map_err(|e| AppError::Auth(format!("malformed query: {}", e)))?;
        let handshake = Self::from_parts(&query, &parts.headers);
        if let Err(e) = &handshake {
            debug!(error = %e, "handshake refused");
        }
        handshake
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn query_parameters_win() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_USER_ID, HeaderValue::from_static("from-header"));
        let hs = Handshake::from_parts(
            &query(&[("token", "t"), ("userId", "u1"), ("username", "Ann")]),
            &headers,
        )
        .unwrap();
        assert_eq!(hs.token, "t");
        assert_eq!(hs.identity, Identity::new("u1", "Ann"));
    }

    #[test]
    fn headers_are_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(HEADER_USER_ID, HeaderValue::from_static("u2"));
        let hs = Handshake::from_parts(&HashMap::new(), &headers).unwrap();
        assert_eq!(hs.token, "abc");
        assert_eq!(hs.identity.user_id, "u2");
        assert_eq!(hs.identity.display_name, DEFAULT_DISPLAY_NAME);
    }

    #[test]
    fn missing_token_or_user_is_refused() {
        let err = Handshake::from_parts(&query(&[("userId", "u1")]), &HeaderMap::new()).unwrap_err();
        assert_eq!(err.code(), "AUTH_FAILED");
        let err = Handshake::from_parts(&query(&[("token", "t")]), &HeaderMap::new()).unwrap_err();
        assert_eq!(err.code(), "AUTH_FAILED");
    }
}
