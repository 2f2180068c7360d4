//! Repositories: voice_sessions (one open row per channel and user).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::DbPool;
use crate::error::AppResult;
use crate::models::{ChannelId, VoiceFlags, VoiceMember};

// ---- Voice sessions ----

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct VoiceSessionRow {
    pub id: Uuid,
    pub channel_id: String,
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub muted: bool,
    pub deafened: bool,
    pub screen_sharing: bool,
    pub video: bool,
}

impl VoiceSessionRow {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }

    pub fn flags(&self) -> VoiceFlags {
        VoiceFlags {
            muted: self.muted,
            deafened: self.deafened,
            screen_sharing: self.screen_sharing,
            video: self.video,
        }
    }

    pub fn member(&self) -> VoiceMember {
        VoiceMember {
            user_id: self.user_id.clone(),
            joined_at: self.joined_at,
            flags: self.flags(),
        }
    }
}

const VOICE_SESSION_COLUMNS: &str =
    "id, channel_id, user_id, joined_at, left_at, muted, deafened, screen_sharing, video";

/// Open a session, or refresh `joined_at` when one is already open.
pub async fn voice_session_open(
    pool: &DbPool,
    channel_id: &str,
    user_id: &str,
) -> AppResult<VoiceSessionRow> {
    let sql = format!(
        r#"
        INSERT INTO voice_sessions (channel_id, user_id)
        VALUES ($1, $2)
        ON CONFLICT (channel_id, user_id) WHERE left_at IS NULL
        DO UPDATE SET joined_at = NOW()
        RETURNING {}
        "#,
        VOICE_SESSION_COLUMNS
    );
    let row = sqlx::query_as::<_, VoiceSessionRow>(&sql)
        .bind(channel_id)
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

/// Overwrite the flags of the open session. `None` when no session is open.
pub async fn voice_session_update_flags(
    pool: &DbPool,
    channel_id: &str,
    user_id: &str,
    flags: VoiceFlags,
) -> AppResult<Option<VoiceSessionRow>> {
    let sql = format!(
        r#"
        UPDATE voice_sessions
        SET muted = $3, deafened = $4, screen_sharing = $5, video = $6
        WHERE channel_id = $1 AND user_id = $2 AND left_at IS NULL
        RETURNING {}
        "#,
        VOICE_SESSION_COLUMNS
    );
    let row = sqlx::query_as::<_, VoiceSessionRow>(&sql)
        .bind(channel_id)
        .bind(user_id)
        .bind(flags.muted)
        .bind(flags.deafened)
        .bind(flags.screen_sharing)
        .bind(flags.video)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Set `left_at` on the open session. Returns false when none was open.
pub async fn voice_session_close(pool: &DbPool, channel_id: &str, user_id: &str) -> AppResult<bool> {
    let r = sqlx::query(
        "UPDATE voice_sessions SET left_at = NOW() WHERE channel_id = $1 AND user_id = $2 AND left_at IS NULL",
    )
    .bind(channel_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(r.rows_affected() > 0)
}

pub async fn voice_sessions_active(pool: &DbPool, channel_id: &str) -> AppResult<Vec<VoiceSessionRow>> {
    let sql = format!(
        "SELECT {} FROM voice_sessions WHERE channel_id = $1 AND left_at IS NULL ORDER BY joined_at",
        VOICE_SESSION_COLUMNS
    );
    let rows = sqlx::query_as::<_, VoiceSessionRow>(&sql)
        .bind(channel_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Most recent session for the pair, open or closed.
pub async fn voice_session_latest(
    pool: &DbPool,
    channel_id: &str,
    user_id: &str,
) -> AppResult<Option<VoiceSessionRow>> {
    let sql = format!(
        "SELECT {} FROM voice_sessions WHERE channel_id = $1 AND user_id = $2 ORDER BY joined_at DESC LIMIT 1",
        VOICE_SESSION_COLUMNS
    );
    let row = sqlx::query_as::<_, VoiceSessionRow>(&sql)
        .bind(channel_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Durable voice-session lifecycle storage.
///
/// Every operation touches a single row, so single-row atomicity of the
/// backing store is all that is required.
#[async_trait]
pub trait VoiceSessionStore: Send + Sync {
    async fn open(&self, channel_id: &ChannelId, user_id: &str) -> AppResult<VoiceSessionRow>;

    async fn update_flags(
        &self,
        channel_id: &ChannelId,
        user_id: &str,
        flags: VoiceFlags,
    ) -> AppResult<Option<VoiceSessionRow>>;

    async fn close(&self, channel_id: &ChannelId, user_id: &str) -> AppResult<bool>;

    async fn active(&self, channel_id: &ChannelId) -> AppResult<Vec<VoiceSessionRow>>;

    async fn latest(&self, channel_id: &ChannelId, user_id: &str)
        -> AppResult<Option<VoiceSessionRow>>;
}

/// PostgreSQL-backed voice-session store.
#[derive(Clone)]
pub struct PgVoiceSessionStore {
    pool: DbPool,
}

impl PgVoiceSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VoiceSessionStore for PgVoiceSessionStore {
    async fn open(&self, channel_id: &ChannelId, user_id: &str) -> AppResult<VoiceSessionRow> {
        voice_session_open(&self.pool, channel_id.as_str(), user_id).await
    }

    async fn update_flags(
        &self,
        channel_id: &ChannelId,
        user_id: &str,
        flags: VoiceFlags,
    ) -> AppResult<Option<VoiceSessionRow>> {
        voice_session_update_flags(&self.pool, channel_id.as_str(), user_id, flags).await
    }

    async fn close(&self, channel_id: &ChannelId, user_id: &str) -> AppResult<bool> {
        voice_session_close(&self.pool, channel_id.as_str(), user_id).await
    }

    async fn active(&self, channel_id: &ChannelId) -> AppResult<Vec<VoiceSessionRow>> {
        voice_sessions_active(&self.pool, channel_id.as_str()).await
    }

    async fn latest(
        &self,
        channel_id: &ChannelId,
        user_id: &str,
    ) -> AppResult<Option<VoiceSessionRow>> {
        voice_session_latest(&self.pool, channel_id.as_str(), user_id).await
    }
}
