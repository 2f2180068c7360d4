//! Per-connection coordination: connect, command dispatch, disconnect cleanup.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

use super::presence::PresenceService;
use super::registry::{ConnectionRegistry, Outbound, RegistryStats};
use super::room::RoomService;
use super::signaling::SignalingRelay;
use super::voice::VoiceService;
use crate::db::VoiceSessionStore;
use crate::error::{AppError, AppResult};
use crate::models::{ClientCommand, ConnectionId, Identity, ServerEvent, SignalKind};
use crate::repositories::{EphemeralStore, FanOut};

/// One instance's coordination layer. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    rooms: RoomService,
    presence: PresenceService,
    voice: VoiceService,
    signaling: SignalingRelay,
    presence_ttl: u64,
}

impl Gateway {
    pub fn new(
        instance_id: &str,
        fanout: Arc<dyn FanOut>,
        store: Arc<dyn EphemeralStore>,
        sessions: Arc<dyn VoiceSessionStore>,
        presence_ttl: u64,
    ) -> Self {
        let rooms = RoomService::new(instance_id, ConnectionRegistry::new(), fanout);
        Self {
            presence: PresenceService::new(store, rooms.clone()),
            voice: VoiceService::new(rooms.clone(), sessions),
            signaling: SignalingRelay::new(rooms.clone()),
            rooms,
            presence_ttl,
        }
    }

    /// Subscribe to global topics. Must run before accepting connections.
    pub async fn start(&self) -> AppResult<()> {
        self.rooms.subscribe_presence().await
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.rooms.registry()
    }

    pub fn presence(&self) -> &PresenceService {
        &self.presence
    }

    pub fn instance_id(&self) -> &str {
        self.rooms.instance_id()
    }

    /// Register an authenticated connection and mark its user online.
    ///
    /// `connection.established` is queued before anything else, so it is
    /// always the first frame the client sees.
    #[instrument(skip(self, sender), fields(user_id = %identity.user_id))]
    pub async fn connect(&self, identity: Identity, sender: Outbound) -> AppResult<ConnectionId> {
        let conn_id = ConnectionId::generate();
        let user_id = identity.user_id.clone();
        let established = ServerEvent::ConnectionEstablished {
            connection_id: conn_id.clone(),
            user_id: user_id.clone(),
        }
        .to_json()?;
        let _ = sender.send(established);

        let _presence = self.registry().presence_guard(&user_id).await;
        let count = self
            .registry()
            .register(conn_id.clone(), identity, sender)
            .await?;
        if let Err(e) = self.presence.set_online(&user_id, self.presence_ttl).await {
            self.registry().unregister(&conn_id).await;
            return Err(e);
        }
        if count == 1 {
            if let Err(e) = self.presence.announce(&user_id).await {
                warn!(user_id = %user_id, error = %e, "online announcement failed");
            }
        }
        info!(conn_id = %conn_id, user_id = %user_id, connections = count, "connected");
        Ok(conn_id)
    }

    /// Execute one client command on behalf of `conn_id`.
    pub async fn handle(
        &self,
        conn_id: &ConnectionId,
        user_id: &str,
        command: ClientCommand,
    ) -> AppResult<()> {
        match command {
            ClientCommand::PresenceUpdate { data } => {
                data.validate()
                    .map_err(|e| AppError::Validation(e.to_string()))?;
                self.presence
                    .set_status(
                        user_id,
                        data.status,
                        data.custom_status.as_deref(),
                        self.presence_ttl,
                    )
                    .await
            }
            ClientCommand::PresenceHeartbeat { .. } => self.heartbeat(user_id).await,
            ClientCommand::RoomJoin { data } => {
                self.rooms.join(conn_id, user_id, &data.room()?).await
            }
            ClientCommand::RoomLeave { data } => {
                self.rooms.leave(conn_id, user_id, &data.room()?).await
            }
            ClientCommand::RoomTyping { data } => {
                self.rooms.typing(conn_id, user_id, &data.room()?).await
            }
            ClientCommand::MessageSend { data } => {
                data.validate()
                    .map_err(|e| AppError::Validation(e.to_string()))?;
                let room = data.room()?;
                self.rooms
                    .send_message(conn_id, user_id, &room, data.content, data.metadata)
                    .await
                    .map(|_| ())
            }
            ClientCommand::VoiceJoin { data } => {
                self.voice.join(conn_id, user_id, &data.channel_id).await
            }
            ClientCommand::VoiceLeave { data } => {
                self.voice.leave(conn_id, user_id, &data.channel_id).await
            }
            ClientCommand::VoiceStateChange { data } => {
                self.voice
                    .state_change(conn_id, user_id, &data.channel_id, data.flags)
                    .await
            }
            ClientCommand::SignalOffer { data } => {
                self.signaling
                    .relay(conn_id, user_id, SignalKind::Offer, data)
                    .await
            }
            ClientCommand::SignalAnswer { data } => {
                self.signaling
                    .relay(conn_id, user_id, SignalKind::Answer, data)
                    .await
            }
            ClientCommand::SignalIceCandidate { data } => {
                self.signaling
                    .relay(conn_id, user_id, SignalKind::IceCandidate, data)
                    .await
            }
        }
    }

    /// `handle`, with any failure reported to the originating connection only.
    pub async fn dispatch(&self, conn_id: &ConnectionId, user_id: &str, command: ClientCommand) {
        let name = command.name();
        if let Err(e) = self.handle(conn_id, user_id, command).await {
            if e.is_transient() {
                warn!(conn_id = %conn_id, command = name, error = %e, "command failed");
            } else {
                debug!(conn_id = %conn_id, command = name, error = %e, "command rejected");
            }
            self.reject(conn_id, &e, Some(name)).await;
        }
    }

    /// Send an `error` event to one connection.
    pub async fn reject(&self, conn_id: &ConnectionId, error: &AppError, command: Option<&str>) {
        let event = ServerEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
            command: command.map(str::to_string),
        };
        match event.to_json() {
            Ok(payload) => {
                self.registry().send(conn_id, payload).await;
            }
            Err(e) => warn!(conn_id = %conn_id, error = %e, "could not encode error reply"),
        }
    }

    async fn heartbeat(&self, user_id: &str) -> AppResult<()> {
        if self.presence.heartbeat(user_id, self.presence_ttl).await? {
            return Ok(());
        }
        debug!(user_id = %user_id, "presence lapsed, restoring");
        let _presence = self.registry().presence_guard(user_id).await;
        self.presence.set_online(user_id, self.presence_ttl).await?;
        self.presence.announce(user_id).await
    }

    /// Tear down a connection. Safe to call more than once; only the first
    /// call does any work. Each step runs even when an earlier one fails.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, conn_id: &ConnectionId) {
        let Some(departure) = self.registry().unregister(conn_id).await else {
            debug!(conn_id = %conn_id, "already disconnected");
            return;
        };
        let user_id = departure.identity.user_id.as_str();

        let (voice_rooms, text_rooms): (Vec<_>, Vec<_>) =
            departure.rooms.iter().partition(|room| room.is_voice());

        for room in text_rooms {
            self.rooms.forget(room).await;
            if let Err(e) = self.rooms.announce_left(conn_id, user_id, room).await {
                warn!(conn_id = %conn_id, room = %room, error = %e, step = "room-leave", "cleanup step failed");
            }
        }
        for room in voice_rooms {
            if let Err(e) = self.voice.depart(conn_id, user_id, room).await {
                warn!(conn_id = %conn_id, room = %room, error = %e, step = "voice-close", "cleanup step failed");
            }
        }
        if departure.remaining_for_user == 0 {
            // A new connection may have registered while the rooms were cleaned up.
            let _presence = self.registry().presence_guard(user_id).await;
            if self.registry().user_connection_count(user_id).await > 0 {
                debug!(conn_id = %conn_id, user_id = %user_id, "user reconnected, staying online");
            } else if let Err(e) = self.presence.set_offline(user_id).await {
                warn!(conn_id = %conn_id, user_id = %user_id, error = %e, step = "presence-offline", "cleanup step failed");
            }
        }
        info!(
            conn_id = %conn_id,
            user_id = %user_id,
            remaining = departure.remaining_for_user,
            "disconnected"
        );
    }

    pub async fn stats(&self) -> RegistryStats {
        self.registry().stats().await
    }

    /// Stop fan-out subscriptions. Live connections are left to close on their own.
    pub async fn shutdown(&self) {
        self.rooms.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryVoiceSessionStore;
    use crate::repositories::{MemoryFanOut, MemoryStore};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc};

    /// In-memory fan-out whose publishes take a while to complete.
    struct SlowFanOut(MemoryFanOut);

    #[async_trait]
    impl FanOut for SlowFanOut {
        async fn publish(&self, topic: &str, payload: &str) -> AppResult<()> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.0.publish(topic, payload).await
        }

        async fn subscribe(&self, topic: &str) -> AppResult<broadcast::Receiver<String>> {
            self.0.subscribe(topic).await
        }
    }

    fn gateway() -> Gateway {
        Gateway::new(
            "i1",
            Arc::new(MemoryFanOut::new(32)),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryVoiceSessionStore::new()),
            60,
        )
    }

    fn command(raw: serde_json::Value) -> ClientCommand {
        serde_json::from_value(raw).unwrap()
    }

    #[tokio::test]
    async fn first_frame_is_connection_established() {
        let gw = gateway();
        gw.start().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = gw.connect(Identity::new("u1", "One"), tx).await.unwrap();

        let first: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["event"], "connection.established");
        assert_eq!(first["data"]["connectionId"], conn.as_str());
        assert!(gw.presence().is_online("u1").await.unwrap());
    }

    #[tokio::test]
    async fn failures_are_reported_to_the_sender() {
        let gw = gateway();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = gw.connect(Identity::new("u1", "One"), tx).await.unwrap();
        rx.recv().await.unwrap();

        let cmd = command(serde_json::json!({
            "event": "voice.stateChange",
            "data": {"channelId": 7, "muted": true}
        }));
        gw.dispatch(&conn, "u1", cmd).await;

        let reply: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["event"], "error");
        assert_eq!(reply["data"]["code"], "STALE_STATE");
        assert_eq!(reply["data"]["command"], "voice.stateChange");
    }

    #[tokio::test]
    async fn oversized_custom_status_is_rejected() {
        let gw = gateway();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = gw.connect(Identity::new("u1", "One"), tx).await.unwrap();

        let cmd = command(serde_json::json!({
            "event": "presence.update",
            "data": {"status": "idle", "customStatus": "x".repeat(129)}
        }));
        let err = gw.handle(&conn, "u1", cmd).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_COMMAND");
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_restores_lapsed_presence() {
        let gw = gateway();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = gw.connect(Identity::new("u1", "One"), tx).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!gw.presence().is_online("u1").await.unwrap());

        let cmd = command(serde_json::json!({"event": "presence.heartbeat"}));
        gw.handle(&conn, "u1", cmd).await.unwrap();
        assert!(gw.presence().is_online("u1").await.unwrap());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let gw = gateway();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = gw.connect(Identity::new("u1", "One"), tx).await.unwrap();
        let cmd = command(serde_json::json!({
            "event": "voice.join",
            "data": {"channelId": "7"}
        }));
        gw.handle(&conn, "u1", cmd).await.unwrap();

        gw.disconnect(&conn).await;
        gw.disconnect(&conn).await;

        assert_eq!(gw.stats().await, RegistryStats::default());
        assert!(!gw.presence().is_online("u1").await.unwrap());
    }

    #[tokio::test]
    async fn bad_room_ids_are_reported_as_invalid_room() {
        let gw = gateway();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = gw.connect(Identity::new("u1", "One"), tx).await.unwrap();
        rx.recv().await.unwrap();

        for room_id in ["dm:5", "text:"] {
            let cmd = command(serde_json::json!({
                "event": "room.join",
                "data": {"roomId": room_id}
            }));
            gw.dispatch(&conn, "u1", cmd).await;

            let reply: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(reply["event"], "error");
            assert_eq!(reply["data"]["code"], "INVALID_ROOM");
            assert_eq!(reply["data"]["command"], "room.join");
        }
        assert_eq!(gw.stats().await.rooms, 0);
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let gw = gateway();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = gw.connect(Identity::new("u1", "One"), tx).await.unwrap();
        gw.handle(
            &conn,
            "u1",
            command(serde_json::json!({"event": "room.join", "data": {"roomId": "text:1"}})),
        )
        .await
        .unwrap();

        let cmd = command(serde_json::json!({
            "event": "message.send",
            "data": {"roomId": "text:1", "content": ""}
        }));
        let err = gw.handle(&conn, "u1", cmd).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_COMMAND");
    }

    #[tokio::test]
    async fn reconnect_during_disconnect_cleanup_stays_online() {
        let gw = Gateway::new(
            "i1",
            Arc::new(SlowFanOut(MemoryFanOut::new(32))),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryVoiceSessionStore::new()),
            60,
        );
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let a = gw.connect(Identity::new("u1", "One"), tx_a).await.unwrap();
        let cmd = command(serde_json::json!({"event": "room.join", "data": {"roomId": "text:1"}}));
        gw.handle(&a, "u1", cmd).await.unwrap();

        let leaving = tokio::spawn({
            let gw = gw.clone();
            async move { gw.disconnect(&a).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        gw.connect(Identity::new("u1", "One"), tx_b).await.unwrap();
        leaving.await.unwrap();

        assert_eq!(gw.registry().user_connection_count("u1").await, 1);
        assert!(gw.presence().is_online("u1").await.unwrap());
    }
}
