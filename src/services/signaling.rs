//! Relay of peer negotiation messages within a voice room.

use tracing::{debug, instrument};

use super::room::RoomService;
use crate::error::{AppError, AppResult};
use crate::models::{ConnectionId, RoomId, ServerEvent, SignalEvent, SignalKind, SignalPayload};

/// Stateless: authorizes on room membership and forwards the payload untouched.
#[derive(Clone)]
pub struct SignalingRelay {
    rooms: RoomService,
}

impl SignalingRelay {
    pub fn new(rooms: RoomService) -> Self {
        Self { rooms }
    }

    #[instrument(skip(self, signal), fields(channel_id = %signal.channel_id))]
    pub async fn relay(
        &self,
        conn_id: &ConnectionId,
        user_id: &str,
        kind: SignalKind,
        signal: SignalPayload,
    ) -> AppResult<()> {
        let room = RoomId::voice(signal.channel_id.clone());
        if !self.rooms.registry().is_member(conn_id, &room).await {
            return Err(AppError::NotAMember(room.to_string()));
        }

        let target_user = signal.target_user_id.clone();
        let event = ServerEvent::signal(
            kind,
            SignalEvent {
                channel_id: signal.channel_id,
                from_user_id: user_id.to_string(),
                payload: signal.payload,
                target_user_id: signal.target_user_id,
            },
        );
        self.rooms.publish(&room, event, None, target_user).await?;
        debug!(conn_id = %conn_id, kind = kind.event_name(), "signal relayed");
        Ok(())
    }
}
