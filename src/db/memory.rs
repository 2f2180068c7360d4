//! In-process voice-session store with the same row semantics as Postgres.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{VoiceSessionRow, VoiceSessionStore};
use crate::error::AppResult;
use crate::models::{ChannelId, VoiceFlags};

#[derive(Clone, Default)]
pub struct MemoryVoiceSessionStore {
    rows: Arc<Mutex<Vec<VoiceSessionRow>>>,
}

impl MemoryVoiceSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row ever written for the pair, oldest first.
    pub async fn history(&self, channel_id: &ChannelId, user_id: &str) -> Vec<VoiceSessionRow> {
        self.rows
            .lock()
            .await
            .iter()
            .filter(|r| r.channel_id == channel_id.as_str() && r.user_id == user_id)
            .cloned()
            .collect()
    }
}

fn is_open(row: &VoiceSessionRow, channel_id: &ChannelId, user_id: &str) -> bool {
    row.left_at.is_none() && row.channel_id == channel_id.as_str() && row.user_id == user_id
}

#[async_trait]
impl VoiceSessionStore for MemoryVoiceSessionStore {
    async fn open(&self, channel_id: &ChannelId, user_id: &str) -> AppResult<VoiceSessionRow> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.iter_mut().find(|r| is_open(r, channel_id, user_id)) {
            row.joined_at = Utc::now();
            return Ok(row.clone());
        }
        let row = VoiceSessionRow {
            id: Uuid::new_v4(),
            channel_id: channel_id.as_str().to_string(),
            user_id: user_id.to_string(),
            joined_at: Utc::now(),
            left_at: None,
            muted: false,
            deafened: false,
            screen_sharing: false,
            video: false,
        };
        rows.push(row.clone());
        Ok(row)
    }

    async fn update_flags(
        &self,
        channel_id: &ChannelId,
        user_id: &str,
        flags: VoiceFlags,
    ) -> AppResult<Option<VoiceSessionRow>> {
        let mut rows = self.rows.lock().await;
        Ok(rows
            .iter_mut()
            .find(|r| is_open(r, channel_id, user_id))
            .map(|row| {
                row.muted = flags.muted;
                row.deafened = flags.deafened;
                row.screen_sharing = flags.screen_sharing;
                row.video = flags.video;
                row.clone()
            }))
    }

    async fn close(&self, channel_id: &ChannelId, user_id: &str) -> AppResult<bool> {
        let mut rows = self.rows.lock().await;
        match rows.iter_mut().find(|r| is_open(r, channel_id, user_id)) {
            Some(row) => {
                row.left_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn active(&self, channel_id: &ChannelId) -> AppResult<Vec<VoiceSessionRow>> {
        let rows = self.rows.lock().await;
        let mut active: Vec<_> = rows
            .iter()
            .filter(|r| r.left_at.is_none() && r.channel_id == channel_id.as_str())
            .cloned()
            .collect();
        active.sort_by_key(|r| r.joined_at);
        Ok(active)
    }

    async fn latest(
        &self,
        channel_id: &ChannelId,
        user_id: &str,
    ) -> AppResult<Option<VoiceSessionRow>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .rev()
            .find(|r| r.channel_id == channel_id.as_str() && r.user_id == user_id)
            .cloned())
    }
}
