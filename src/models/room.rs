//! Room kinds and naming conventions.
//!
//! Text and voice rooms share one id namespace and are told apart by a
//! kind prefix: `text:42` and `voice:42` never collide.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

const MAX_CHANNEL_ID_LEN: usize = 64;

/// Room kind based on prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    /// Text channel: membership and typing events.
    Text,
    /// Voice channel: backed by a durable voice session.
    Voice,
}

impl RoomKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            RoomKind::Text => "text",
            RoomKind::Voice => "voice",
        }
    }
}

/// Channel identifier as sent by clients; accepts JSON strings or numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AppError::InvalidRoom("empty channel id".to_string()));
        }
        if raw.len() > MAX_CHANNEL_ID_LEN {
            return Err(AppError::InvalidRoom(format!(
                "channel id longer than {} characters",
                MAX_CHANNEL_ID_LEN
            )));
        }
        if raw.contains(':') || raw.chars().any(char::is_whitespace) {
            return Err(AppError::InvalidRoom(format!("malformed channel id {:?}", raw)));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(u64),
}

/// Accept a string or numeric id without interpreting it, so that a bad
/// room id surfaces as `INVALID_ROOM` when parsed rather than failing the
/// whole command.
pub fn deserialize_raw_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawId::deserialize(deserializer)? {
            RawId::Text(s) => ChannelId::parse(&s).map_err(de::Error::custom),
            RawId::Number(n) => Ok(ChannelId(n.to_string())),
        }
    }
}

/// Namespaced room identifier, rendered as `<kind>:<channel>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId {
    kind: RoomKind,
    channel: ChannelId,
}

impl RoomId {
    pub fn text(channel: ChannelId) -> Self {
        Self {
            kind: RoomKind::Text,
            channel,
        }
    }

    pub fn voice(channel: ChannelId) -> Self {
        Self {
            kind: RoomKind::Voice,
            channel,
        }
    }

    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn is_voice(&self) -> bool {
        self.kind == RoomKind::Voice
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.channel)
    }
}

impl FromStr for RoomId {
    type Err = AppError;

    /// `text:<id>`, `voice:<id>`, or a bare id which means a text room.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once(':') {
            Some(("text", rest)) => Ok(RoomId::text(ChannelId::parse(rest)?)),
            Some(("voice", rest)) => Ok(RoomId::voice(ChannelId::parse(rest)?)),
            Some((prefix, _)) => Err(AppError::InvalidRoom(format!(
                "unknown room kind {:?}",
                prefix
            ))),
            None => Ok(RoomId::text(ChannelId::parse(s)?)),
        }
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawId::deserialize(deserializer)? {
            RawId::Text(s) => s.parse().map_err(de::Error::custom),
            RawId::Number(n) => Ok(RoomId::text(ChannelId(n.to_string()))),
        }
    }
}
