//! Presence: online state and user-chosen status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Upper bound on `customStatus` length, in characters.
pub const CUSTOM_STATUS_MAX_LEN: u64 = 128;

/// User presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Idle,
    #[serde(rename = "dnd", alias = "do_not_disturb", alias = "doNotDisturb")]
    DoNotDisturb,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Idle => "idle",
            PresenceStatus::DoNotDisturb => "dnd",
            PresenceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(PresenceStatus::Online),
            "idle" => Ok(PresenceStatus::Idle),
            "dnd" | "do_not_disturb" | "doNotDisturb" => Ok(PresenceStatus::DoNotDisturb),
            "offline" => Ok(PresenceStatus::Offline),
            other => Err(AppError::Validation(format!("unknown status {:?}", other))),
        }
    }
}

/// Current presence of one user as read from the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub user_id: String,
    pub online: bool,
    pub status: PresenceStatus,
    pub custom_status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dnd_aliases_deserialize() {
        for raw in ["\"dnd\"", "\"do_not_disturb\"", "\"doNotDisturb\""] {
            let status: PresenceStatus = serde_json::from_str(raw).unwrap();
            assert_eq!(status, PresenceStatus::DoNotDisturb);
        }
        assert_eq!(
            serde_json::to_string(&PresenceStatus::DoNotDisturb).unwrap(),
            "\"dnd\""
        );
    }

    #[test]
    fn status_round_trips_through_store_text() {
        for status in [
            PresenceStatus::Online,
            PresenceStatus::Idle,
            PresenceStatus::DoNotDisturb,
            PresenceStatus::Offline,
        ] {
            assert_eq!(status.as_str().parse::<PresenceStatus>().unwrap(), status);
        }
        assert!("away".parse::<PresenceStatus>().is_err());
    }
}
