//! Room membership and scoped broadcast across instances.
//!
//! Each instance subscribes to a room's fan-out topic while it holds at
//! least one local member of that room, and projects every envelope it
//! receives onto its own local connections. The origin instance receives
//! its own publishes the same way, so there is exactly one delivery path.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::registry::ConnectionRegistry;
use crate::error::{AppError, AppResult};
use crate::models::{ChatMessage, ConnectionId, Envelope, RoomId, ServerEvent};
use crate::repositories::FanOut;

/// Topic carrying presence events to every instance.
pub const PRESENCE_TOPIC: &str = "presence";

pub fn room_topic(room: &RoomId) -> String {
    format!("room:{}", room)
}

/// Manages room membership: local registry updates plus one fan-out subscription per active room.
#[derive(Clone)]
pub struct RoomService {
    instance_id: Arc<str>,
    registry: ConnectionRegistry,
    fanout: Arc<dyn FanOut>,
    /// topic -> task forwarding fan-out messages to local connections
    subscriptions: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl RoomService {
    pub fn new(instance_id: &str, registry: ConnectionRegistry, fanout: Arc<dyn FanOut>) -> Self {
        Self {
            instance_id: Arc::from(instance_id),
            registry,
            fanout,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Start receiving presence events. Called once at startup.
    pub async fn subscribe_presence(&self) -> AppResult<()> {
        self.ensure_subscribed(PRESENCE_TOPIC.to_string()).await
    }

    /// Number of fan-out topics this instance currently listens on.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    async fn ensure_subscribed(&self, topic: String) -> AppResult<()> {
        let mut subs = self.subscriptions.lock().await;
        if let Some(handle) = subs.get(&topic) {
            if !handle.is_finished() {
                return Ok(());
            }
        }
        let rx = self.fanout.subscribe(&topic).await?;
        let handle = tokio::spawn(forward_to_local(
            topic.clone(),
            rx,
            self.registry.clone(),
        ));
        subs.insert(topic, handle);
        Ok(())
    }

    /// Drop the room's subscription once no local connection is left in it.
    async fn release_if_idle(&self, room: &RoomId) {
        let mut subs = self.subscriptions.lock().await;
        if !self.registry.connections_in_room(room).await.is_empty() {
            return;
        }
        let topic = room_topic(room);
        if let Some(handle) = subs.remove(&topic) {
            handle.abort();
            debug!(topic = %topic, "unsubscribed from idle room");
        }
    }

    /// Add the connection to the room locally and make sure this instance
    /// receives the room's traffic. Returns false when it was already a member.
    pub async fn attach(&self, conn_id: &ConnectionId, room: &RoomId) -> AppResult<bool> {
        let added = self.registry.add_room(conn_id, room).await?;
        if let Err(e) = self.ensure_subscribed(room_topic(room)).await {
            if added {
                self.detach(conn_id, room).await;
            }
            return Err(e);
        }
        Ok(added)
    }

    /// Remove the connection from the room locally. Returns false when it was not a member.
    pub async fn detach(&self, conn_id: &ConnectionId, room: &RoomId) -> bool {
        let removed = self.registry.remove_room(conn_id, room).await;
        self.release_if_idle(room).await;
        removed
    }

    /// Release subscriptions left idle by a connection that is already unregistered.
    pub async fn forget(&self, room: &RoomId) {
        self.release_if_idle(room).await;
    }

    /// Broadcast an event to a room on every instance.
    pub async fn publish(
        &self,
        room: &RoomId,
        event: ServerEvent,
        exclude: Option<&ConnectionId>,
        target_user: Option<String>,
    ) -> AppResult<()> {
        let envelope = Envelope {
            origin: self.instance_id.to_string(),
            room: Some(room.clone()),
            exclude: exclude.cloned(),
            target_user,
            event,
        };
        let payload = serde_json::to_string(&envelope)?;
        self.fanout.publish(&room_topic(room), &payload).await
    }

    /// Broadcast an event to every connection on every instance.
    pub async fn publish_global(&self, event: ServerEvent) -> AppResult<()> {
        let envelope = Envelope {
            origin: self.instance_id.to_string(),
            room: None,
            exclude: None,
            target_user: None,
            event,
        };
        let payload = serde_json::to_string(&envelope)?;
        self.fanout.publish(PRESENCE_TOPIC, &payload).await
    }

    /// `room.join`: text rooms only; announces the member to the rest of the room.
    #[instrument(skip(self))]
    pub async fn join(&self, conn_id: &ConnectionId, user_id: &str, room: &RoomId) -> AppResult<()> {
        ensure_text(room)?;
        let added = self.attach(conn_id, room).await?;
        self.publish(
            room,
            ServerEvent::RoomMemberJoined {
                room_id: room.clone(),
                user_id: user_id.to_string(),
            },
            Some(conn_id),
            None,
        )
        .await?;
        info!(conn_id = %conn_id, user_id = %user_id, room = %room, added, "joined room");
        Ok(())
    }

    /// `room.leave`: a leave for a room the connection is not in is a no-op.
    #[instrument(skip(self))]
    pub async fn leave(&self, conn_id: &ConnectionId, user_id: &str, room: &RoomId) -> AppResult<()> {
        ensure_text(room)?;
        if !self.detach(conn_id, room).await {
            debug!(conn_id = %conn_id, room = %room, "leave for a room not joined");
            return Ok(());
        }
        self.announce_left(conn_id, user_id, room).await?;
        info!(conn_id = %conn_id, user_id = %user_id, room = %room, "left room");
        Ok(())
    }

    /// Publish `room.memberLeft` for a connection that is no longer in the room.
    pub async fn announce_left(
        &self,
        conn_id: &ConnectionId,
        user_id: &str,
        room: &RoomId,
    ) -> AppResult<()> {
        self.publish(
            room,
            ServerEvent::RoomMemberLeft {
                room_id: room.clone(),
                user_id: user_id.to_string(),
            },
            Some(conn_id),
            None,
        )
        .await
    }

    /// `room.typing`: members only, sender excluded.
    pub async fn typing(&self, conn_id: &ConnectionId, user_id: &str, room: &RoomId) -> AppResult<()> {
        ensure_text(room)?;
        if !self.registry.is_member(conn_id, room).await {
            return Err(AppError::NotAMember(room.to_string()));
        }
        self.publish(
            room,
            ServerEvent::RoomTyping {
                room_id: room.clone(),
                user_id: user_id.to_string(),
            },
            Some(conn_id),
            None,
        )
        .await
    }

    /// `message.send`: members only, delivered to the whole room including the sender.
    #[instrument(skip(self, content, metadata))]
    pub async fn send_message(
        &self,
        conn_id: &ConnectionId,
        user_id: &str,
        room: &RoomId,
        content: String,
        metadata: Option<serde_json::Value>,
    ) -> AppResult<ChatMessage> {
        ensure_text(room)?;
        if !self.registry.is_member(conn_id, room).await {
            return Err(AppError::NotAMember(room.to_string()));
        }
        let message = ChatMessage::new(room, user_id, content, metadata);
        self.publish(room, ServerEvent::MessageNew(message.clone()), None, None)
            .await?;
        info!(user_id = %user_id, room = %room, message_id = %message.id, "message sent");
        Ok(message)
    }

    /// Stop every fan-out subscription (shutdown).
    pub async fn shutdown(&self) {
        let mut subs = self.subscriptions.lock().await;
        for (topic, handle) in subs.drain() {
            handle.abort();
            debug!(topic = %topic, "subscription stopped");
        }
    }
}

fn ensure_text(room: &RoomId) -> AppResult<()> {
    if room.is_voice() {
        return Err(AppError::InvalidRoom(format!(
            "{} is a voice room; use voice.join / voice.leave",
            room
        )));
    }
    Ok(())
}

/// Project a topic's envelopes onto local connections until the topic closes.
async fn forward_to_local(
    topic: String,
    mut rx: broadcast::Receiver<String>,
    registry: ConnectionRegistry,
) {
    loop {
        match rx.recv().await {
            Ok(raw) => {
                let envelope = match serde_json::from_str::<Envelope>(&raw) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "dropping malformed envelope");
                        continue;
                    }
                };
                let payload = match envelope.event.to_json() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "dropping unserializable event");
                        continue;
                    }
                };
                let delivered = registry
                    .deliver(
                        envelope.room.as_ref(),
                        &payload,
                        envelope.exclude.as_ref(),
                        envelope.target_user.as_deref(),
                    )
                    .await;
                debug!(topic = %topic, origin = %envelope.origin, delivered, "fan-out delivered");
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(topic = %topic, skipped, "fan-out receiver lagged, events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!(topic = %topic, "fan-out forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelId, Identity};
    use crate::repositories::MemoryFanOut;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
        let raw = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        serde_json::from_str(&raw).unwrap()
    }

    fn text(id: &str) -> RoomId {
        RoomId::text(ChannelId::parse(id).unwrap())
    }

    #[tokio::test]
    async fn join_notifies_other_members_but_not_the_joiner() {
        let hub = MemoryFanOut::new(16);
        let registry = ConnectionRegistry::new();
        let rooms = RoomService::new("i1", registry.clone(), Arc::new(hub));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = ConnectionId::from("a");
        let b = ConnectionId::from("b");
        registry.register(a.clone(), Identity::new("ua", "A"), tx_a).await.unwrap();
        registry.register(b.clone(), Identity::new("ub", "B"), tx_b).await.unwrap();

        rooms.join(&a, "ua", &text("42")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        rooms.join(&b, "ub", &text("42")).await.unwrap();

        let event = next_event(&mut rx_a).await;
        assert_eq!(event["event"], "room.memberJoined");
        assert_eq!(event["data"]["userId"], "ub");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn voice_rooms_are_rejected_by_room_join() {
        let registry = ConnectionRegistry::new();
        let rooms = RoomService::new("i1", registry.clone(), Arc::new(MemoryFanOut::new(4)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = ConnectionId::from("a");
        registry.register(a.clone(), Identity::new("ua", "A"), tx).await.unwrap();

        let err = rooms.join(&a, "ua", &"voice:7".parse().unwrap()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_ROOM");
        assert_eq!(registry.stats().await.rooms, 0);
    }

    #[tokio::test]
    async fn idle_rooms_release_their_subscription() {
        let hub = MemoryFanOut::new(4);
        let registry = ConnectionRegistry::new();
        let rooms = RoomService::new("i1", registry.clone(), Arc::new(hub.clone()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = ConnectionId::from("a");
        registry.register(a.clone(), Identity::new("ua", "A"), tx).await.unwrap();

        rooms.join(&a, "ua", &text("1")).await.unwrap();
        assert_eq!(rooms.subscription_count().await, 1);
        rooms.leave(&a, "ua", &text("1")).await.unwrap();
        assert_eq!(rooms.subscription_count().await, 0);

        rooms.leave(&a, "ua", &text("1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.subscriber_count("room:text:1").await, 0);
    }

    #[tokio::test]
    async fn messages_reach_the_sender_too() {
        let registry = ConnectionRegistry::new();
        let rooms = RoomService::new("i1", registry.clone(), Arc::new(MemoryFanOut::new(16)));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = ConnectionId::from("a");
        let b = ConnectionId::from("b");
        registry.register(a.clone(), Identity::new("ua", "A"), tx_a).await.unwrap();
        registry.register(b.clone(), Identity::new("ub", "B"), tx_b).await.unwrap();
        rooms.attach(&a, &text("5")).await.unwrap();
        rooms.attach(&b, &text("5")).await.unwrap();

        let metadata = serde_json::json!({"replyTo": "m1"});
        let sent = rooms
            .send_message(&a, "ua", &text("5"), "hello".to_string(), Some(metadata.clone()))
            .await
            .unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let event = next_event(rx).await;
            assert_eq!(event["event"], "message.new");
            assert_eq!(event["data"]["id"], sent.id.to_string());
            assert_eq!(event["data"]["authorId"], "ua");
            assert_eq!(event["data"]["content"], "hello");
            assert_eq!(event["data"]["metadata"], metadata);
        }
    }

    #[tokio::test]
    async fn messages_require_membership() {
        let registry = ConnectionRegistry::new();
        let hub = MemoryFanOut::new(4);
        let rooms = RoomService::new("i1", registry.clone(), Arc::new(hub.clone()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = ConnectionId::from("a");
        registry.register(a.clone(), Identity::new("ua", "A"), tx).await.unwrap();

        let err = rooms
            .send_message(&a, "ua", &text("5"), "hello".to_string(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_A_MEMBER");
        assert_eq!(hub.subscriber_count("room:text:5").await, 0);
    }

    #[tokio::test]
    async fn typing_requires_membership() {
        let registry = ConnectionRegistry::new();
        let rooms = RoomService::new("i1", registry.clone(), Arc::new(MemoryFanOut::new(4)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = ConnectionId::from("a");
        registry.register(a.clone(), Identity::new("ua", "A"), tx).await.unwrap();

        let err = rooms.typing(&a, "ua", &text("9")).await.unwrap_err();
        assert_eq!(err.code(), "NOT_A_MEMBER");
    }
}
