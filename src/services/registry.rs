//! Process-local registry of live connections and their room memberships.
//!
//! The registry is the authority for "how many connections does this user
//! hold here", which gates presence going offline. All mutation happens
//! under one lock so a disconnect observes a consistent per-user count.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::models::{ConnectionId, Identity, RoomId};

/// Outbound queue of one connection; the socket writer drains it.
pub type Outbound = mpsc::UnboundedSender<String>;

struct ConnectionEntry {
    identity: Identity,
    rooms: HashSet<RoomId>,
    sender: Outbound,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    /// user_id -> live local connections
    users: HashMap<String, usize>,
}

impl RegistryInner {
    fn detach_from_room(&mut self, conn_id: &ConnectionId, room: &RoomId) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(conn_id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }
}

/// Snapshot of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub identity: Identity,
    pub rooms: HashSet<RoomId>,
}

/// What a connection left behind when it was unregistered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub identity: Identity,
    pub rooms: HashSet<RoomId>,
    /// Connections the same user still holds on this instance.
    pub remaining_for_user: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub connections: usize,
    pub users: usize,
    pub rooms: usize,
    pub voice_sessions: usize,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    /// user_id -> lock serializing presence transitions of that user
    presence_gates: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns the user's local connection count including this one.
    pub async fn register(
        &self,
        conn_id: ConnectionId,
        identity: Identity,
        sender: Outbound,
    ) -> AppResult<usize> {
        let mut inner = self.inner.write().await;
        if inner.connections.contains_key(&conn_id) {
            return Err(AppError::Validation(format!(
                "connection {} already registered",
                conn_id
            )));
        }
        let count = {
            let count = inner.users.entry(identity.user_id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        debug!(conn_id = %conn_id, user_id = %identity.user_id, count, "registered");
        inner.connections.insert(
            conn_id,
            ConnectionEntry {
                identity,
                rooms: HashSet::new(),
                sender,
            },
        );
        Ok(count)
    }

    /// Add a room to a connection. Returns false when it was already a member.
    pub async fn add_room(&self, conn_id: &ConnectionId, room: &RoomId) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown connection {}", conn_id)))?;
        if !entry.rooms.insert(room.clone()) {
            return Ok(false);
        }
        inner
            .rooms
            .entry(room.clone())
            .or_default()
            .insert(conn_id.clone());
        Ok(true)
    }

    /// Remove a room from a connection. Returns false when it was not a member.
    pub async fn remove_room(&self, conn_id: &ConnectionId, room: &RoomId) -> bool {
        let mut inner = self.inner.write().await;
        let removed = inner
            .connections
            .get_mut(conn_id)
            .map(|entry| entry.rooms.remove(room))
            .unwrap_or(false);
        if removed {
            inner.detach_from_room(conn_id, room);
        }
        removed
    }

    /// Drop a connection and all its memberships. `None` when already gone.
    pub async fn unregister(&self, conn_id: &ConnectionId) -> Option<Departure> {
        let mut inner = self.inner.write().await;
        let entry = inner.connections.remove(conn_id)?;
        for room in &entry.rooms {
            inner.detach_from_room(conn_id, room);
        }
        let user_id = entry.identity.user_id.clone();
        let remaining = match inner.users.get_mut(&user_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            _ => {
                inner.users.remove(&user_id);
                0
            }
        };
        debug!(conn_id = %conn_id, user_id = %user_id, remaining, "unregistered");
        Some(Departure {
            identity: entry.identity,
            rooms: entry.rooms,
            remaining_for_user: remaining,
        })
    }

    /// Local members of a room.
    pub async fn connections_in_room(&self, room: &RoomId) -> HashSet<ConnectionId> {
        self.inner
            .read()
            .await
            .rooms
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_member(&self, conn_id: &ConnectionId, room: &RoomId) -> bool {
        self.inner
            .read()
            .await
            .connections
            .get(conn_id)
            .map(|entry| entry.rooms.contains(room))
            .unwrap_or(false)
    }

    pub async fn connection(&self, conn_id: &ConnectionId) -> Option<ConnectionInfo> {
        self.inner
            .read()
            .await
            .connections
            .get(conn_id)
            .map(|entry| ConnectionInfo {
                id: conn_id.clone(),
                identity: entry.identity.clone(),
                rooms: entry.rooms.clone(),
            })
    }

    /// Serialize presence transitions for one user on this instance.
    ///
    /// Hold the guard from the connection count check through the presence
    /// write, so a connect cannot interleave with the offline step of a
    /// concurrent disconnect.
    pub async fn presence_guard(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.presence_gates.lock().await;
            gates.retain(|_, gate| Arc::strong_count(gate) > 1);
            gates.entry(user_id.to_string()).or_default().clone()
        };
        gate.lock_owned().await
    }

    pub async fn user_connection_count(&self, user_id: &str) -> usize {
        self.inner.read().await.users.get(user_id).copied().unwrap_or(0)
    }

    /// Whether any local connection of `user_id` is in `room`.
    pub async fn user_in_room(&self, user_id: &str, room: &RoomId) -> bool {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(room)
            .map(|members| {
                members.iter().any(|id| {
                    inner
                        .connections
                        .get(id)
                        .map(|entry| entry.identity.user_id == user_id)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    /// Voice rooms the connection currently belongs to.
    pub async fn voice_rooms_of(&self, conn_id: &ConnectionId) -> Vec<RoomId> {
        self.inner
            .read()
            .await
            .connections
            .get(conn_id)
            .map(|entry| entry.rooms.iter().filter(|r| r.is_voice()).cloned().collect())
            .unwrap_or_default()
    }

    /// Queue a payload for one connection. False when it is gone.
    pub async fn send(&self, conn_id: &ConnectionId, payload: String) -> bool {
        self.inner
            .read()
            .await
            .connections
            .get(conn_id)
            .map(|entry| entry.sender.send(payload).is_ok())
            .unwrap_or(false)
    }

    /// Queue a payload for local connections: members of `room`, or everyone
    /// when `room` is `None`, minus `exclude`, restricted to `target_user`
    /// when set. Returns how many connections it was queued for.
    pub async fn deliver(
        &self,
        room: Option<&RoomId>,
        payload: &str,
        exclude: Option<&ConnectionId>,
        target_user: Option<&str>,
    ) -> usize {
        let inner = self.inner.read().await;
        let recipients: Vec<&ConnectionId> = match room {
            Some(room) => match inner.rooms.get(room) {
                Some(members) => members.iter().collect(),
                None => return 0,
            },
            None => inner.connections.keys().collect(),
        };

        let mut delivered = 0;
        for conn_id in recipients {
            if exclude == Some(conn_id) {
                continue;
            }
            let Some(entry) = inner.connections.get(conn_id) else {
                continue;
            };
            if let Some(target) = target_user {
                if entry.identity.user_id != target {
                    continue;
                }
            }
            if entry.sender.send(payload.to_string()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        RegistryStats {
            connections: inner.connections.len(),
            users: inner.users.len(),
            rooms: inner.rooms.len(),
            voice_sessions: inner
                .rooms
                .iter()
                .filter(|(room, _)| room.is_voice())
                .map(|(_, members)| {
                    members
                        .iter()
                        .filter_map(|id| inner.connections.get(id))
                        .map(|entry| entry.identity.user_id.as_str())
                        .collect::<HashSet<_>>()
                        .len()
                })
                .sum(),
        }
    }
}
