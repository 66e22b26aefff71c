use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A live identity: a stable user code bound to the connection that
/// currently speaks for it. The code outlives the binding; the binding
/// is replaced on every reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_code: String,
    pub name: String,
    pub connection_id: Uuid,
    pub device_class: DeviceClass,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Mobile,
    Desktop,
    Web,
}

/// Two-party conversation summary. The id is a pure function of the
/// unordered pair of participant codes, so both sides derive the same one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub participants: [String; 2],
    pub participant_details: HashMap<String, ParticipantDetail>,
    #[serde(rename = "messageMode")]
    pub retention_mode: RetentionMode,
    pub last_message: String,
    pub last_message_time: DateTime<Utc>,
}

impl Conversation {
    /// Canonical conversation id for a pair of user codes: uppercase,
    /// lexicographically sorted, joined with `_`.
    pub fn canonical_id(code_a: &str, code_b: &str) -> String {
        let a = code_a.to_uppercase();
        let b = code_b.to_uppercase();
        let mut pair = [a, b];
        pair.sort();
        pair.join("_")
    }

    pub fn is_participant(&self, user_code: &str) -> bool {
        self.participants.iter().any(|p| p == user_code)
    }
}

/// Best-effort cached display info for a participant. Partial when a
/// participant has never been live while this record existed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDetail {
    pub user_code: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionMode {
    #[default]
    Permanent,
    Ephemeral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_user_code: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub delivered: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    Audio,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_id_is_order_independent() {
        assert_eq!(
            Conversation::canonical_id("AB12CD", "ZZ99YY"),
            Conversation::canonical_id("ZZ99YY", "AB12CD"),
        );
        assert_eq!(Conversation::canonical_id("AB12CD", "ZZ99YY"), "AB12CD_ZZ99YY");
    }

    #[test]
    fn canonical_id_normalizes_case() {
        assert_eq!(Conversation::canonical_id("ab12cd", "ZZ99YY"), "AB12CD_ZZ99YY");
    }
}
