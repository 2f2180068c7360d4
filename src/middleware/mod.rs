//! Request extractors shared by the HTTP and WebSocket surface.

pub mod auth;

pub use auth::Handshake;
