//! In-call state carried by voice sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Independently toggleable in-call flags. Missing fields read as `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceFlags {
    pub muted: bool,
    pub deafened: bool,
    pub screen_sharing: bool,
    pub video: bool,
}

/// Participant entry in a `voice.activeMembers` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceMember {
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
    #[serde(flatten)]
    pub flags: VoiceFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_default_to_false_when_omitted() {
        let flags: VoiceFlags = serde_json::from_str(r#"{"muted":true}"#).unwrap();
        assert_eq!(
            flags,
            VoiceFlags {
                muted: true,
                ..VoiceFlags::default()
            }
        );
    }

    #[test]
    fn flags_use_camel_case_on_the_wire() {
        let flags = VoiceFlags {
            screen_sharing: true,
            ..VoiceFlags::default()
        };
        let json = serde_json::to_value(flags).unwrap();
        assert_eq!(json["screenSharing"], true);
    }
}
