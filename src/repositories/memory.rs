//! In-process fan-out and TTL store for single-node deployments and tests.
//!
//! Clones share state, so several coordinators built from clones of one
//! `MemoryFanOut` behave like separate instances on one Redis.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;

use super::{EphemeralStore, FanOut};
use crate::error::AppResult;

/// In-memory pub/sub implementation.
#[derive(Clone)]
pub struct MemoryFanOut {
    /// Topic → broadcast sender
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
    buffer_size: usize,
}

impl MemoryFanOut {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Number of live receivers on `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl FanOut for MemoryFanOut {
    async fn publish(&self, topic: &str, payload: &str) -> AppResult<()> {
        let topics = self.topics.read().await;
        if let Some(tx) = topics.get(topic) {
            let _ = tx.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> AppResult<broadcast::Receiver<String>> {
        let mut topics = self.topics.write().await;
        let tx = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0);
        Ok(tx.subscribe())
    }
}

/// In-memory key-value store with lazy expiry.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn deadline(ttl_secs: u64) -> Instant {
    Instant::now() + Duration::from_secs(ttl_secs)
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> AppResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), (value.to_string(), deadline(ttl_secs)));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> AppResult<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some((_, expires_at)) if *expires_at > Instant::now() => {
                *expires_at = deadline(ttl_secs);
                Ok(true)
            }
            Some(_) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn del(&self, keys: &[&str]) -> AppResult<()> {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}
