//! Voice sessions: durable lifecycle rows plus ephemeral in-call flags.
//!
//! Per (channel, user) the session is either Absent (no open row) or Active
//! (open row). Joining writes the row before anyone is told; a state change
//! against a closed row is stale and never re-opens it.

use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::room::RoomService;
use crate::db::VoiceSessionStore;
use crate::error::{AppError, AppResult};
use crate::models::{ChannelId, ConnectionId, RoomId, ServerEvent, VoiceFlags, VoiceMember};

#[derive(Clone)]
pub struct VoiceService {
    rooms: RoomService,
    sessions: Arc<dyn VoiceSessionStore>,
}

impl VoiceService {
    pub fn new(rooms: RoomService, sessions: Arc<dyn VoiceSessionStore>) -> Self {
        Self { rooms, sessions }
    }

    /// Join a voice room, leaving any other voice room this connection is in first.
    #[instrument(skip(self))]
    pub async fn join(
        &self,
        conn_id: &ConnectionId,
        user_id: &str,
        channel_id: &ChannelId,
    ) -> AppResult<()> {
        let room = RoomId::voice(channel_id.clone());
        for previous in self.rooms.registry().voice_rooms_of(conn_id).await {
            if previous != room {
                self.leave(conn_id, user_id, previous.channel()).await?;
            }
        }

        let added = self.rooms.attach(conn_id, &room).await?;
        if let Err(e) = self.sessions.open(channel_id, user_id).await {
            if added {
                self.rooms.detach(conn_id, &room).await;
            }
            return Err(e);
        }

        self.rooms
            .publish(
                &room,
                ServerEvent::VoiceUserJoined {
                    channel_id: channel_id.clone(),
                    user_id: user_id.to_string(),
                },
                Some(conn_id),
                None,
            )
            .await?;

        let members = self.members(channel_id, Some(user_id)).await?;
        let reply = ServerEvent::VoiceActiveMembers {
            channel_id: channel_id.clone(),
            members,
        }
        .to_json()?;
        self.rooms.registry().send(conn_id, reply).await;

        info!(conn_id = %conn_id, user_id = %user_id, channel_id = %channel_id, "joined voice");
        Ok(())
    }

    /// Overwrite the in-call flags of an Active session and broadcast the full set.
    #[instrument(skip(self))]
    pub async fn state_change(
        &self,
        conn_id: &ConnectionId,
        user_id: &str,
        channel_id: &ChannelId,
        flags: VoiceFlags,
    ) -> AppResult<()> {
        let row = self
            .sessions
            .update_flags(channel_id, user_id, flags)
            .await?
            .ok_or_else(|| {
                AppError::StaleState(format!("no active voice session in {}", channel_id))
            })?;

        self.rooms
            .publish(
                &RoomId::voice(channel_id.clone()),
                ServerEvent::VoiceStateChanged {
                    channel_id: channel_id.clone(),
                    user_id: user_id.to_string(),
                    flags: row.flags(),
                },
                Some(conn_id),
                None,
            )
            .await
    }

    /// Explicit `voice.leave`. The row stays open while another local
    /// connection of the same user is still in the room.
    #[instrument(skip(self))]
    pub async fn leave(
        &self,
        conn_id: &ConnectionId,
        user_id: &str,
        channel_id: &ChannelId,
    ) -> AppResult<()> {
        let room = RoomId::voice(channel_id.clone());
        let was_member = self.rooms.detach(conn_id, &room).await;
        if self.rooms.registry().user_in_room(user_id, &room).await {
            debug!(conn_id = %conn_id, user_id = %user_id, "user still in voice on another connection");
            return Ok(());
        }

        let closed = self.sessions.close(channel_id, user_id).await?;
        if !was_member && !closed {
            debug!(conn_id = %conn_id, channel_id = %channel_id, "leave for a voice room not joined");
            return Ok(());
        }
        self.announce_left(conn_id, user_id, channel_id).await?;
        info!(conn_id = %conn_id, user_id = %user_id, channel_id = %channel_id, "left voice");
        Ok(())
    }

    /// Disconnect cleanup for a voice room of an already-unregistered connection.
    ///
    /// `voice.userLeft` is published even when closing the row fails; the
    /// close error is still returned to the caller.
    pub async fn depart(
        &self,
        conn_id: &ConnectionId,
        user_id: &str,
        room: &RoomId,
    ) -> AppResult<()> {
        self.rooms.forget(room).await;
        if self.rooms.registry().user_in_room(user_id, room).await {
            return Ok(());
        }
        let closed = self.sessions.close(room.channel(), user_id).await;
        self.announce_left(conn_id, user_id, room.channel()).await?;
        closed.map(|_| ())
    }

    /// Active members of a voice channel, optionally without one user.
    pub async fn members(
        &self,
        channel_id: &ChannelId,
        except_user: Option<&str>,
    ) -> AppResult<Vec<VoiceMember>> {
        Ok(self
            .sessions
            .active(channel_id)
            .await?
            .iter()
            .filter(|row| Some(row.user_id.as_str()) != except_user)
            .map(|row| row.member())
            .collect())
    }

    async fn announce_left(
        &self,
        conn_id: &ConnectionId,
        user_id: &str,
        channel_id: &ChannelId,
    ) -> AppResult<()> {
        self.rooms
            .publish(
                &RoomId::voice(channel_id.clone()),
                ServerEvent::VoiceUserLeft {
                    channel_id: channel_id.clone(),
                    user_id: user_id.to_string(),
                },
                Some(conn_id),
                None,
            )
            .await
    }
}
