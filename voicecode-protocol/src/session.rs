//! Payload types that appear inside session-related wire messages.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// One transcript record as read from a `.jsonl` session file.
///
/// Only the fields the core cares about (§3 "Message record") are modeled
/// explicitly; everything else the agent writes is preserved opaquely.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MessageRecord {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, rename = "isSidechain", skip_serializing_if = "is_false")]
    pub is_sidechain: bool,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl MessageRecord {
    /// A message is internal plumbing (never shown to a client, never
    /// counted) when it is a sidechain record or carries one of the two
    /// sentinel `type` values (§3 invariants, §4.2 step 3).
    pub fn is_internal(&self) -> bool {
        self.is_sidechain
            || matches!(self.record_type.as_deref(), Some("summary") | Some("system"))
    }
}

/// Summary of a session as it appears in `session_list` / `recent_sessions` /
/// `session_created` / `session_updated` (§6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub working_directory: String,
    /// ISO-8601 `Z` timestamp, e.g. `2026-07-27T10:00:00.000Z`.
    pub last_modified: String,
    pub message_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workstream_id: Option<String>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn sidechain_message_is_internal() {
        let m = MessageRecord {
            role: "user".into(),
            text: Some("x".into()),
            timestamp: None,
            is_sidechain: true,
            record_type: None,
            usage: None,
            cost: None,
        };
        assert!(m.is_internal());
    }

    #[test]
    fn summary_and_system_types_are_internal() {
        for ty in ["summary", "system"] {
            let m = MessageRecord {
                role: "assistant".into(),
                text: None,
                timestamp: None,
                is_sidechain: false,
                record_type: Some(ty.to_string()),
                usage: None,
                cost: None,
            };
            assert!(m.is_internal());
        }
    }

    #[test]
    fn ordinary_message_is_not_internal() {
        let m = MessageRecord {
            role: "assistant".into(),
            text: Some("hello".into()),
            timestamp: None,
            is_sidechain: false,
            record_type: None,
            usage: None,
            cost: None,
        };
        assert!(!m.is_internal());
    }

    #[test]
    fn deserializes_camelcase_is_sidechain() {
        let json = r#"{"role":"user","text":"x","isSidechain":true}"#;
        let m: MessageRecord = serde_json::from_str(json).unwrap();
        assert!(m.is_sidechain);
    }
}
