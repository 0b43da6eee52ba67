//! The framed message envelope (§4.1, §6).
//!
//! Every frame is a JSON object with a `type` discriminant; `ClientMessage`
//! and `ServerMessage` are internally-tagged enums (`#[serde(tag = "type")]`)
//! so decode/encode is a single `serde_json` call and the wire string for
//! each variant falls out of `rename_all = "snake_case"` applied to the
//! Rust variant name — e.g. `ClearContext` <-> `"clear_context"`.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::session::MessageRecord;
use crate::session::SessionSummary;

/// Messages a client may send to the daemon.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Connect {
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recent_sessions_limit: Option<u32>,
    },
    Subscribe {
        session_id: String,
    },
    Unsubscribe {
        session_id: String,
    },
    Prompt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workstream_id: Option<String>,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_directory: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    ClearContext {
        workstream_id: String,
    },
    SetDirectory {
        working_directory: String,
    },
    SessionDeleted {
        session_id: String,
    },
    CompactSession {
        session_id: String,
    },
    UploadFile {
        filename: String,
        content: String,
        storage_location: String,
    },
    ListResources {
        storage_location: String,
    },
    DeleteResource {
        storage_location: String,
        filename: String,
    },
    StartRecipe {
        recipe_id: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_directory: Option<String>,
    },
    RefreshSessions,
    GetAvailableRecipes,
    CreateWorkstream {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_directory: Option<String>,
    },
    WorkstreamUpdated {
        workstream_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    WorkstreamList,
}

/// Messages the daemon may send to a client.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        version: String,
        auth_version: String,
        instructions: String,
    },
    AuthError {
        message: String,
    },
    SessionList {
        sessions: Vec<SessionSummary>,
        total_count: usize,
    },
    RecentSessions {
        sessions: Vec<SessionSummary>,
        limit: usize,
    },
    SessionCreated {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        working_directory: String,
        last_modified: String,
        message_count: u64,
    },
    SessionUpdated {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        working_directory: String,
        last_modified: String,
        message_count: u64,
        messages: Vec<MessageRecord>,
    },
    AvailableCommands {
        working_directory: String,
        project_commands: Vec<crate::commands::CommandEntry>,
        general_commands: Vec<crate::commands::CommandEntry>,
    },
    Ack {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    Response {
        session_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<Value>,
    },
    TurnComplete {
        session_id: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    SessionLocked {
        session_id: String,
        message: String,
    },
    Pong,
    RecipeStarted {
        session_id: String,
        recipe_id: String,
        step: String,
    },
    RecipeStepTransition {
        session_id: String,
        from_step: String,
        to_step: String,
        outcome: String,
    },
    RecipeExited {
        session_id: String,
        reason: String,
    },
    OrchestrationRetry {
        session_id: String,
        step: String,
    },
    ContextCleared {
        workstream_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_claude_session_id: Option<String>,
    },
    WorkstreamCreated {
        workstream_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active_claude_session_id: Option<String>,
    },
    WorkstreamUpdated {
        workstream_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active_claude_session_id: Option<String>,
    },
    WorkstreamList {
        workstreams: Vec<WorkstreamSummary>,
    },
    FileUploaded {
        success: bool,
        filename: String,
        path: String,
        size: u64,
        timestamp: String,
    },
    ResourcesList {
        resources: Vec<ResourceEntry>,
    },
    ResourceDeleted {
        filename: String,
    },
    CompactionComplete {
        session_id: String,
    },
    CompactionError {
        session_id: String,
        error: String,
    },
    AvailableRecipes {
        recipes: Vec<RecipeSummary>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkstreamSummary {
    pub workstream_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_claude_session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceEntry {
    pub filename: String,
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecipeSummary {
    pub id: String,
    pub initial_step: String,
    pub steps: Vec<String>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn ping_has_no_extra_fields_on_the_wire() {
        let json = serde_json::to_value(ClientMessage::Ping).unwrap();
        assert_eq!(json, serde_json::json!({"type": "ping"}));
    }

    #[test]
    fn connect_round_trips_through_json() {
        let msg = ClientMessage::Connect {
            api_key: "voice-code-00000000000000000000000000000000".into(),
            session_id: None,
            recent_sessions_limit: Some(5),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn prompt_wire_shape_uses_snake_case_keys() {
        let json = serde_json::json!({
            "type": "prompt",
            "new_session_id": "00000000-0000-0000-0000-000000000001",
            "text": "hi",
            "working_directory": "/tmp/p",
        });
        let msg: ClientMessage = serde_json::from_value(json).unwrap();
        match msg {
            ClientMessage::Prompt {
                new_session_id,
                resume_session_id,
                workstream_id,
                text,
                ..
            } => {
                assert_eq!(new_session_id.as_deref(), Some("00000000-0000-0000-0000-000000000001"));
                assert!(resume_session_id.is_none());
                assert!(workstream_id.is_none());
                assert_eq!(text, "hi");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_to_decode_without_panicking() {
        let json = serde_json::json!({"type": "not_a_real_message"});
        let result: Result<ClientMessage, _> = serde_json::from_value(json);
        assert!(result.is_err());
    }

    #[test]
    fn auth_error_message_is_the_fixed_string() {
        let msg = ServerMessage::AuthError {
            message: "Authentication failed".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["message"], "Authentication failed");
        assert_eq!(json["type"], "auth_error");
    }
}
