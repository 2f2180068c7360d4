//! Wire messages: client commands, server events and the fan-out envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::connection::ConnectionId;
use crate::error::AppResult;
use super::presence::PresenceStatus;
use super::room::{deserialize_raw_id, ChannelId, RoomId};
use super::voice::{VoiceFlags, VoiceMember};

/// WebSocket client message. Every command is `{"event": <name>, "data": {..}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientCommand {
    #[serde(rename = "presence.update")]
    PresenceUpdate { data: PresenceUpdatePayload },
    #[serde(rename = "presence.heartbeat")]
    PresenceHeartbeat {
        #[serde(default)]
        data: EmptyPayload,
    },
    #[serde(rename = "room.join")]
    RoomJoin { data: RoomPayload },
    #[serde(rename = "room.leave")]
    RoomLeave { data: RoomPayload },
    #[serde(rename = "room.typing")]
    RoomTyping { data: RoomPayload },
    #[serde(rename = "message.send")]
    MessageSend { data: MessagePayload },
    #[serde(rename = "voice.join")]
    VoiceJoin { data: VoiceChannelPayload },
    #[serde(rename = "voice.leave")]
    VoiceLeave { data: VoiceChannelPayload },
    #[serde(rename = "voice.stateChange")]
    VoiceStateChange { data: VoiceStatePayload },
    #[serde(rename = "signal.offer")]
    SignalOffer { data: SignalPayload },
    #[serde(rename = "signal.answer")]
    SignalAnswer { data: SignalPayload },
    #[serde(rename = "signal.iceCandidate")]
    SignalIceCandidate { data: SignalPayload },
}

impl ClientCommand {
    /// Wire name, echoed back in error replies.
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::PresenceUpdate { .. } => "presence.update",
            ClientCommand::PresenceHeartbeat { .. } => "presence.heartbeat",
            ClientCommand::RoomJoin { .. } => "room.join",
            ClientCommand::RoomLeave { .. } => "room.leave",
            ClientCommand::RoomTyping { .. } => "room.typing",
            ClientCommand::MessageSend { .. } => "message.send",
            ClientCommand::VoiceJoin { .. } => "voice.join",
            ClientCommand::VoiceLeave { .. } => "voice.leave",
            ClientCommand::VoiceStateChange { .. } => "voice.stateChange",
            ClientCommand::SignalOffer { .. } => SignalKind::Offer.event_name(),
            ClientCommand::SignalAnswer { .. } => SignalKind::Answer.event_name(),
            ClientCommand::SignalIceCandidate { .. } => SignalKind::IceCandidate.event_name(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyPayload {}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdatePayload {
    pub status: PresenceStatus,
    #[serde(default)]
    #[validate(length(max = 128))]
    pub custom_status: Option<String>,
}

/// Maximum length of a relayed chat message body, in characters.
pub const MESSAGE_MAX_LEN: u64 = 4000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    #[serde(deserialize_with = "deserialize_raw_id")]
    pub room_id: String,
}

impl RoomPayload {
    pub fn room(&self) -> AppResult<RoomId> {
        self.room_id.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(deserialize_with = "deserialize_raw_id")]
    pub room_id: String,
    #[validate(length(min = 1, max = 4000))]
    pub content: String,
    /// Opaque client data (attachments, mentions), relayed verbatim.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl MessagePayload {
    pub fn room(&self) -> AppResult<RoomId> {
        self.room_id.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceChannelPayload {
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceStatePayload {
    pub channel_id: ChannelId,
    #[serde(flatten)]
    pub flags: VoiceFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub channel_id: ChannelId,
    /// Opaque negotiation payload, relayed verbatim.
    pub payload: serde_json::Value,
    #[serde(default)]
    pub target_user_id: Option<String>,
}

/// Negotiation message kinds handled by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalKind::Offer => "signal.offer",
            SignalKind::Answer => "signal.answer",
            SignalKind::IceCandidate => "signal.iceCandidate",
        }
    }
}

/// Relayed negotiation message as delivered to room members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEvent {
    pub channel_id: ChannelId,
    pub from_user_id: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
}

/// Chat message as delivered to every member of a text room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: RoomId,
    pub channel_id: ChannelId,
    pub author_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        room: &RoomId,
        author_id: &str,
        content: String,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id: room.clone(),
            channel_id: room.channel().clone(),
            author_id: author_id.to_string(),
            content,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// Event sent over WebSocket to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connection.established", rename_all = "camelCase")]
    ConnectionEstablished {
        connection_id: ConnectionId,
        user_id: String,
    },
    #[serde(rename = "presence.changed", rename_all = "camelCase")]
    PresenceChanged {
        user_id: String,
        status: PresenceStatus,
        custom_status: Option<String>,
    },
    #[serde(rename = "room.memberJoined", rename_all = "camelCase")]
    RoomMemberJoined { room_id: RoomId, user_id: String },
    #[serde(rename = "room.memberLeft", rename_all = "camelCase")]
    RoomMemberLeft { room_id: RoomId, user_id: String },
    #[serde(rename = "room.typing", rename_all = "camelCase")]
    RoomTyping { room_id: RoomId, user_id: String },
    #[serde(rename = "message.new")]
    MessageNew(ChatMessage),
    #[serde(rename = "voice.userJoined", rename_all = "camelCase")]
    VoiceUserJoined { channel_id: ChannelId, user_id: String },
    #[serde(rename = "voice.userLeft", rename_all = "camelCase")]
    VoiceUserLeft { channel_id: ChannelId, user_id: String },
    #[serde(rename = "voice.stateChanged", rename_all = "camelCase")]
    VoiceStateChanged {
        channel_id: ChannelId,
        user_id: String,
        flags: VoiceFlags,
    },
    #[serde(rename = "voice.activeMembers", rename_all = "camelCase")]
    VoiceActiveMembers {
        channel_id: ChannelId,
        members: Vec<VoiceMember>,
    },
    #[serde(rename = "signal.offer")]
    SignalOffer(SignalEvent),
    #[serde(rename = "signal.answer")]
    SignalAnswer(SignalEvent),
    #[serde(rename = "signal.iceCandidate")]
    SignalIceCandidate(SignalEvent),
    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
}

impl ServerEvent {
    pub fn signal(kind: SignalKind, event: SignalEvent) -> Self {
        match kind {
            SignalKind::Offer => ServerEvent::SignalOffer(event),
            SignalKind::Answer => ServerEvent::SignalAnswer(event),
            SignalKind::IceCandidate => ServerEvent::SignalIceCandidate(event),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Message carried on the fan-out channel between instances.
///
/// Every instance holding a local member of `room` (every instance at all
/// for room-less events) delivers `event` to those members, minus
/// `exclude`, and only to `target_user` when it is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: String,
    #[serde(default)]
    pub room: Option<RoomId>,
    #[serde(default)]
    pub exclude: Option<ConnectionId>,
    #[serde(default)]
    pub target_user: Option<String>,
    pub event: ServerEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::presence::CUSTOM_STATUS_MAX_LEN;
    use serde_json::json;

    #[test]
    fn parses_room_join() {
        let cmd: ClientCommand =
            serde_json::from_value(json!({"event": "room.join", "data": {"roomId": "text:42"}}))
                .unwrap();
        match cmd {
            ClientCommand::RoomJoin { data } => assert_eq!(data.room().unwrap().to_string(), "text:42"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_room_kind_parses_as_a_command() {
        let cmd: ClientCommand =
            serde_json::from_value(json!({"event": "room.join", "data": {"roomId": "dm:5"}}))
                .unwrap();
        match cmd {
            ClientCommand::RoomJoin { data } => {
                assert_eq!(data.room().unwrap_err().code(), "INVALID_ROOM");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn message_send_with_numeric_room_and_metadata() {
        let cmd: ClientCommand = serde_json::from_value(json!({
            "event": "message.send",
            "data": {"roomId": 42, "content": "hello", "metadata": {"mentions": ["u2"]}}
        }))
        .unwrap();
        assert_eq!(cmd.name(), "message.send");
        match cmd {
            ClientCommand::MessageSend { data } => {
                assert_eq!(data.room().unwrap().to_string(), "text:42");
                assert_eq!(data.metadata, Some(json!({"mentions": ["u2"]})));
                assert!(data.validate().is_ok());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn message_content_must_be_non_empty_and_bounded() {
        let mut payload = MessagePayload {
            room_id: "text:1".to_string(),
            content: String::new(),
            metadata: None,
        };
        assert!(payload.validate().is_err());
        payload.content = "x".repeat(MESSAGE_MAX_LEN as usize + 1);
        assert!(payload.validate().is_err());
        payload.content = "x".repeat(MESSAGE_MAX_LEN as usize);
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn chat_message_shape() {
        let room: RoomId = "text:42".parse().unwrap();
        let message = ChatMessage::new(&room, "u1", "hi".to_string(), None);
        let value = serde_json::to_value(ServerEvent::MessageNew(message.clone())).unwrap();
        assert_eq!(value["event"], "message.new");
        assert_eq!(value["data"]["roomId"], "text:42");
        assert_eq!(value["data"]["channelId"], "42");
        assert_eq!(value["data"]["authorId"], "u1");
        assert_eq!(value["data"]["id"], message.id.to_string());
        assert!(value["data"].get("metadata").is_none());
        assert!(value["data"]["createdAt"].is_string());
    }

    #[test]
    fn heartbeat_data_is_optional() {
        let bare: ClientCommand =
            serde_json::from_value(json!({"event": "presence.heartbeat"})).unwrap();
        let with_data: ClientCommand =
            serde_json::from_value(json!({"event": "presence.heartbeat", "data": {}})).unwrap();
        assert_eq!(bare.name(), "presence.heartbeat");
        assert_eq!(with_data.name(), "presence.heartbeat");
    }

    #[test]
    fn parses_voice_state_change_with_flat_flags() {
        let cmd: ClientCommand = serde_json::from_value(json!({
            "event": "voice.stateChange",
            "data": {"channelId": 7, "muted": true, "deafened": false, "screenSharing": false, "video": false}
        }))
        .unwrap();
        match cmd {
            ClientCommand::VoiceStateChange { data } => {
                assert_eq!(data.channel_id.as_str(), "7");
                assert!(data.flags.muted);
                assert!(!data.flags.video);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn custom_status_length_is_bounded() {
        let at_limit = PresenceUpdatePayload {
            status: PresenceStatus::Idle,
            custom_status: Some("x".repeat(CUSTOM_STATUS_MAX_LEN as usize)),
        };
        assert!(at_limit.validate().is_ok());

        let payload = PresenceUpdatePayload {
            status: PresenceStatus::Idle,
            custom_status: Some("x".repeat(CUSTOM_STATUS_MAX_LEN as usize + 1)),
        };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn signal_payload_is_kept_verbatim() {
        let cmd: ClientCommand = serde_json::from_value(json!({
            "event": "signal.iceCandidate",
            "data": {"channelId": "7", "payload": {"candidate": "a=1", "sdpMid": null}}
        }))
        .unwrap();
        match cmd {
            ClientCommand::SignalIceCandidate { data } => {
                assert_eq!(data.payload, json!({"candidate": "a=1", "sdpMid": null}));
                assert!(data.target_user_id.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn server_event_shape() {
        let event = ServerEvent::RoomMemberJoined {
            room_id: "text:42".parse().unwrap(),
            user_id: "u1".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"event": "room.memberJoined", "data": {"roomId": "text:42", "userId": "u1"}})
        );
    }

    #[test]
    fn envelope_survives_the_wire() {
        let envelope = Envelope {
            origin: "i1".to_string(),
            room: Some("voice:7".parse().unwrap()),
            exclude: None,
            target_user: Some("u2".to_string()),
            event: ServerEvent::signal(
                SignalKind::Offer,
                SignalEvent {
                    channel_id: ChannelId::parse("7").unwrap(),
                    from_user_id: "u1".to_string(),
                    payload: json!({"sdp": "v=0"}),
                    target_user_id: Some("u2".to_string()),
                },
            ),
        };
        let text = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, envelope);
    }
}
