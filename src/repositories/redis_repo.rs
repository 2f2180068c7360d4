//! Redis connection and pub/sub for room fan-out and presence storage.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{EphemeralStore, FanOut};
use crate::error::AppError;

const TOPIC_PREFIX: &str = "signal:";

fn topic_key(topic: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, topic)
}

/// Redis-backed repository: pub/sub for events, TTL keys for presence.
#[derive(Clone)]
pub struct RedisRepository {
    client: Arc<redis::Client>,
    commands: ConnectionManager,
    buffer: usize,
}

impl RedisRepository {
    /// Connect to Redis. The command connection reconnects on its own.
    pub async fn connect(redis_url: &str, buffer: usize) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)?;
        let commands = ConnectionManager::new(client.clone()).await?;
        info!("redis connection established");
        Ok(Self {
            client: Arc::new(client),
            commands,
            buffer: buffer.max(1),
        })
    }

    fn connection(&self) -> ConnectionManager {
        self.commands.clone()
    }

    /// Round-trip check used at startup.
    pub async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.connection();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl FanOut for RedisRepository {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), AppError> {
        let mut conn = self.connection();
        let count: u64 = conn.publish(topic_key(topic), payload).await?;
        debug!(topic = %topic, count, "published");
        Ok(())
    }

    /// Uses one Redis connection per topic, forwarding messages to a broadcast channel.
    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<String>, AppError> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(topic_key(topic)).await?;
        info!(topic = %topic, "subscribed to redis topic");

        let (tx, rx) = broadcast::channel(self.buffer);
        let mut stream = pubsub.into_on_message();
        let topic = topic.to_string();

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(topic = %topic, error = %e, "dropping non-text payload"),
                }
            }
            debug!(topic = %topic, "redis subscription closed");
        });

        Ok(rx)
    }
}

#[async_trait]
impl EphemeralStore for RedisRepository {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), AppError> {
        let mut conn = self.connection();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, AppError> {
        let mut conn = self.connection();
        let updated: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.connection();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn del(&self, keys: &[&str]) -> Result<(), AppError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }
}
