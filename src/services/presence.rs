//! Presence: TTL-backed online state and status in the shared store.
//!
//! A user is online while `presence:{user}` exists. Nothing here counts
//! connections; callers gate `set_offline` on the registry's per-user count.

use std::sync::Arc;
use tracing::{info, instrument};

use super::room::RoomService;
use crate::error::{AppError, AppResult};
use crate::models::{PresenceSnapshot, PresenceStatus, ServerEvent, CUSTOM_STATUS_MAX_LEN};
use crate::repositories::EphemeralStore;

const PRESENCE_PREFIX: &str = "presence:";
const STATUS_PREFIX: &str = "status:";
const CUSTOM_STATUS_PREFIX: &str = "custom_status:";
const ONLINE: &str = "online";

fn presence_key(user_id: &str) -> String {
    format!("{}{}", PRESENCE_PREFIX, user_id)
}

fn status_key(user_id: &str) -> String {
    format!("{}{}", STATUS_PREFIX, user_id)
}

fn custom_status_key(user_id: &str) -> String {
    format!("{}{}", CUSTOM_STATUS_PREFIX, user_id)
}

/// Presence operations: online/offline, heartbeat, status.
#[derive(Clone)]
pub struct PresenceService {
    store: Arc<dyn EphemeralStore>,
    rooms: RoomService,
}

impl PresenceService {
    pub fn new(store: Arc<dyn EphemeralStore>, rooms: RoomService) -> Self {
        Self { store, rooms }
    }

    /// Mark the user online, overwriting any previous record.
    #[instrument(skip(self))]
    pub async fn set_online(&self, user_id: &str, ttl_secs: u64) -> AppResult<()> {
        self.store
            .set_ex(&presence_key(user_id), ONLINE, ttl_secs)
            .await
    }

    /// Extend the presence TTL. Returns false when the record has lapsed;
    /// the caller must `set_online` again in that case.
    pub async fn heartbeat(&self, user_id: &str, ttl_secs: u64) -> AppResult<bool> {
        if !self.store.expire(&presence_key(user_id), ttl_secs).await? {
            return Ok(false);
        }
        self.store.expire(&status_key(user_id), ttl_secs).await?;
        self.store.expire(&custom_status_key(user_id), ttl_secs).await?;
        Ok(true)
    }

    /// Clear the user's presence and announce them offline.
    #[instrument(skip(self))]
    pub async fn set_offline(&self, user_id: &str) -> AppResult<()> {
        let keys = [
            presence_key(user_id),
            status_key(user_id),
            custom_status_key(user_id),
        ];
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.store.del(&keys).await?;
        self.rooms
            .publish_global(ServerEvent::PresenceChanged {
                user_id: user_id.to_string(),
                status: PresenceStatus::Offline,
                custom_status: None,
            })
            .await?;
        info!(user_id = %user_id, "user offline");
        Ok(())
    }

    pub async fn is_online(&self, user_id: &str) -> AppResult<bool> {
        Ok(self.store.get(&presence_key(user_id)).await?.as_deref() == Some(ONLINE))
    }

    /// Store a status and broadcast it. Does not change online state.
    #[instrument(skip(self))]
    pub async fn set_status(
        &self,
        user_id: &str,
        status: PresenceStatus,
        custom_status: Option<&str>,
        ttl_secs: u64,
    ) -> AppResult<()> {
        let custom_status = custom_status.map(str::trim).filter(|s| !s.is_empty());
        if let Some(custom) = custom_status {
            if custom.chars().count() as u64 > CUSTOM_STATUS_MAX_LEN {
                return Err(AppError::Validation(format!(
                    "customStatus longer than {} characters",
                    CUSTOM_STATUS_MAX_LEN
                )));
            }
        }

        self.store
            .set_ex(&status_key(user_id), status.as_str(), ttl_secs)
            .await?;
        match custom_status {
            Some(custom) => {
                self.store
                    .set_ex(&custom_status_key(user_id), custom, ttl_secs)
                    .await?
            }
            None => self.store.del(&[custom_status_key(user_id).as_str()]).await?,
        }

        self.rooms
            .publish_global(ServerEvent::PresenceChanged {
                user_id: user_id.to_string(),
                status,
                custom_status: custom_status.map(str::to_string),
            })
            .await?;
        info!(user_id = %user_id, status = %status, "presence updated");
        Ok(())
    }

    /// Current presence; a lapsed record reads as offline.
    pub async fn status(&self, user_id: &str) -> AppResult<PresenceSnapshot> {
        if !self.is_online(user_id).await? {
            return Ok(PresenceSnapshot {
                user_id: user_id.to_string(),
                online: false,
                status: PresenceStatus::Offline,
                custom_status: None,
            });
        }
        let status = match self.store.get(&status_key(user_id)).await? {
            Some(raw) => raw.parse().unwrap_or(PresenceStatus::Online),
            None => PresenceStatus::Online,
        };
        let custom_status = self.store.get(&custom_status_key(user_id)).await?;
        Ok(PresenceSnapshot {
            user_id: user_id.to_string(),
            online: true,
            status,
            custom_status,
        })
    }

    /// Broadcast the user's current presence to everyone.
    pub async fn announce(&self, user_id: &str) -> AppResult<()> {
        let snapshot = self.status(user_id).await?;
        self.rooms
            .publish_global(ServerEvent::PresenceChanged {
                user_id: snapshot.user_id,
                status: snapshot.status,
                custom_status: snapshot.custom_status,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::{MemoryFanOut, MemoryStore};
    use crate::services::registry::ConnectionRegistry;
    use std::time::Duration;

    fn service() -> PresenceService {
        let rooms = RoomService::new(
            "i1",
            ConnectionRegistry::new(),
            Arc::new(MemoryFanOut::new(8)),
        );
        PresenceService::new(Arc::new(MemoryStore::new()), rooms)
    }

    #[tokio::test(start_paused = true)]
    async fn online_until_ttl_lapses() {
        let presence = service();
        presence.set_online("u1", 60).await.unwrap();
        assert!(presence.is_online("u1").await.unwrap());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!presence.is_online("u1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_user_online() {
        let presence = service();
        presence.set_online("u1", 60).await.unwrap();
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(50)).await;
            assert!(presence.heartbeat("u1", 60).await.unwrap());
        }
        assert!(presence.is_online("u1").await.unwrap());
    }

    #[tokio::test]
    async fn heartbeat_without_record_is_a_no_op() {
        let presence = service();
        assert!(!presence.heartbeat("ghost", 60).await.unwrap());
        assert!(!presence.is_online("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn status_does_not_change_online_state() {
        let presence = service();
        presence
            .set_status("u1", PresenceStatus::DoNotDisturb, Some("focus"), 60)
            .await
            .unwrap();
        assert!(!presence.is_online("u1").await.unwrap());

        presence.set_online("u1", 60).await.unwrap();
        let snapshot = presence.status("u1").await.unwrap();
        assert_eq!(snapshot.status, PresenceStatus::DoNotDisturb);
        assert_eq!(snapshot.custom_status.as_deref(), Some("focus"));
    }

    #[tokio::test]
    async fn blank_custom_status_clears_it() {
        let presence = service();
        presence.set_online("u1", 60).await.unwrap();
        presence
            .set_status("u1", PresenceStatus::Idle, Some("lunch"), 60)
            .await
            .unwrap();
        presence
            .set_status("u1", PresenceStatus::Idle, Some("  "), 60)
            .await
            .unwrap();
        assert_eq!(presence.status("u1").await.unwrap().custom_status, None);
    }

    #[tokio::test]
    async fn offline_clears_everything() {
        let presence = service();
        presence.set_online("u1", 60).await.unwrap();
        presence
            .set_status("u1", PresenceStatus::Idle, None, 60)
            .await
            .unwrap();
        presence.set_offline("u1").await.unwrap();

        let snapshot = presence.status("u1").await.unwrap();
        assert!(!snapshot.online);
        assert_eq!(snapshot.status, PresenceStatus::Offline);
    }
}
