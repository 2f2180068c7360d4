//! Shared ephemeral store and cross-instance fan-out channel.
//!
//! Both are injected into the services as trait objects so the backing
//! technology (Redis in production, in-process for single-node runs and
//! tests) can be swapped without touching coordination logic.

mod memory;
mod redis_repo;

pub use memory::{MemoryFanOut, MemoryStore};
pub use redis_repo::RedisRepository;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::AppResult;

/// Distributed publish/subscribe channel.
///
/// Delivery is at-most-once and best-effort: an instance that is not
/// subscribed when a message is published never sees it. The publisher
/// also receives its own messages when it is subscribed to the topic.
#[async_trait]
pub trait FanOut: Send + Sync {
    /// Publish `payload` to every instance subscribed to `topic`.
    async fn publish(&self, topic: &str, payload: &str) -> AppResult<()>;

    /// Subscribe to `topic`. Each message is yielded once per receiver.
    /// The subscription ends when every receiver has been dropped.
    async fn subscribe(&self, topic: &str) -> AppResult<broadcast::Receiver<String>>;
}

/// Key-value store with per-key TTL, shared by all instances.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl_secs`.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> AppResult<()>;

    /// Reset the TTL of an existing key. Returns false when the key is absent.
    async fn expire(&self, key: &str, ttl_secs: u64) -> AppResult<bool>;

    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    async fn del(&self, keys: &[&str]) -> AppResult<()>;
}
