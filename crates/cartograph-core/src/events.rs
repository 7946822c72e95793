// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token/cost usage for a single model request, or an accumulated total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input: u32,
    pub output: u32,
    pub cache_read: u32,
    pub cache_write: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
    }
}

/// Speaker of a message, shared by inbound agent content and outbound chat history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A block of an assistant message's final content, used to detect whether a
/// turn ended with tool calls still pending (see turn-end detection, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolResult { id: String, output: String },
}

impl ContentBlock {
    pub fn is_tool(&self) -> bool {
        matches!(self, ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Sub-kind of a `message_update` event, mirroring streamed content deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageUpdateKind {
    TextStart,
    TextDelta,
    TextEnd,
    ThinkingStart,
    ThinkingDelta,
    ThinkingEnd,
}

/// How an error from the agent runtime should be handled by the supervisor.
/// `Unknown` takes the conservative path of `Transient` (attempt a restart)
/// rather than silently giving up; see the crash-classification open question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Auth,
    Transient,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct AgentFailure {
    pub message: String,
    pub class: FailureClass,
}

/// Events emitted by the agent runtime. The supervisor consumes these and
/// forwards a trimmed subset to the hub as [`RpcEvent`]s.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart,
    AgentEnd,
    MessageStart {
        role: Role,
    },
    MessageUpdate {
        kind: MessageUpdateKind,
        delta: Option<String>,
        content_index: Option<usize>,
        content: Option<String>,
    },
    MessageEnd {
        role: Role,
        content: Vec<ContentBlock>,
        usage: Option<Usage>,
    },
    ToolExecutionStart {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolExecutionEnd {
        id: String,
        name: String,
        result: String,
        is_error: bool,
    },
    ToolExecutionUpdate {
        id: String,
        name: String,
    },
    AutoCompactionStart,
    AutoCompactionEnd,
    AutoRetryStart,
    AutoRetryEnd,
    Error(AgentFailure),
}

impl AgentEvent {
    /// True for an assistant `message_end` whose content is entirely text,
    /// i.e. no tool calls were requested — one of the two turn-end signals.
    pub fn is_text_only_turn_end(&self) -> bool {
        matches!(
            self,
            AgentEvent::MessageEnd { role: Role::Assistant, content, .. }
                if !content.is_empty() && content.iter().all(|b| !b.is_tool())
        )
    }
}

// ── Outbound wire events (engine → browser) ─────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStartInfo {
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessageEvent {
    #[serde(rename = "type")]
    pub kind: MessageUpdateKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(rename = "contentIndex", skip_serializing_if = "Option::is_none")]
    pub content_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEndInfo {
    pub role: Role,
    pub text: String,
    pub usage: Option<Usage>,
}

/// The narrow subset of [`AgentEvent`] actually forwarded to browser clients,
/// wrapped inside a `rpc_event` envelope. Kept as a distinct type from
/// `AgentEvent` so the wire surface never grows with internal-only cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RpcEvent {
    AgentStart,
    AgentEnd,
    MessageStart {
        message: MessageStartInfo,
    },
    MessageUpdate {
        assistant_message_event: AssistantMessageEvent,
    },
    TextDone,
    MessageEnd {
        message: MessageEndInfo,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSnapshot {
    pub usage: Usage,
    pub cost: f64,
    pub model: String,
    pub timestamp: DateTime<Utc>,
}

/// Every message type the engine can push down a browser WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Init {
        agent_running: bool,
        is_streaming: bool,
        html_path: Option<String>,
        target_path: String,
        prompt: Option<String>,
        validating: bool,
        last_activity_ts: Option<DateTime<Utc>>,
        model: String,
        provider: String,
        is_subscription: bool,
        depth: String,
        usage: Usage,
    },
    RpcEvent {
        event: RpcEvent,
    },
    DocReady {
        path: String,
    },
    DocValidated {
        path: String,
    },
    RenderError {
        error: String,
    },
    ValidationStart {
        total: usize,
    },
    ValidationBlock {
        index: usize,
        total: usize,
        status: ValidationStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ValidationEnd {
        ok: bool,
        error_count: usize,
        total: usize,
    },
    ValidationFixRequest {
        attempt: u32,
        max_attempts: u32,
    },
    ValidationGaveUp {
        attempt: u32,
    },
    AgentExit {
        error: String,
        crash_count: u32,
        will_restart: bool,
        restart_in: Option<u64>,
    },
    AgentRestarting {
        attempt: u32,
        max_attempts: u32,
        restart_in: u64,
    },
    AgentStopped,
    AgentHealth {
        healthy: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        failures: Option<u32>,
        #[serde(rename = "silentMin", skip_serializing_if = "Option::is_none")]
        silent_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        restored: Option<bool>,
    },
    Heartbeat {
        agent_running: bool,
        is_streaming: bool,
        html_path: Option<String>,
        validating: bool,
        last_activity_ts: Option<DateTime<Utc>>,
        healthy: bool,
        consecutive_health_failures: u32,
        ts: DateTime<Utc>,
        usage: Usage,
        model: String,
        provider: String,
        is_subscription: bool,
    },
    CostUpdate {
        latest: CostSnapshot,
        session: Usage,
        model: String,
        provider: String,
        is_subscription: bool,
    },
    StatusUpdate {
        usage: Usage,
        model: String,
        provider: String,
        is_subscription: bool,
    },
    ChatHistory {
        messages: Vec<ChatMessage>,
        is_full_history: bool,
    },
    ModelChanged {
        model: String,
        provider: String,
        is_subscription: bool,
    },
    ModelChangeError {
        error: String,
    },
}

// ── Inbound wire messages (browser → engine) ────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    Prompt { text: String },
    Abort,
    Stop,
    ChangeModel { model_id: String, provider: String },
    LoadHistory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_text_only_turn_end_true_for_plain_text() {
        let ev = AgentEvent::MessageEnd {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: "done".into() }],
            usage: None,
        };
        assert!(ev.is_text_only_turn_end());
    }

    #[test]
    fn is_text_only_turn_end_false_with_tool_call() {
        let ev = AgentEvent::MessageEnd {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text { text: "let me check".into() },
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "read_file".into(),
                    args: serde_json::json!({}),
                },
            ],
            usage: None,
        };
        assert!(!ev.is_text_only_turn_end());
    }

    #[test]
    fn is_text_only_turn_end_false_when_empty() {
        let ev = AgentEvent::MessageEnd {
            role: Role::Assistant,
            content: vec![],
            usage: None,
        };
        assert!(!ev.is_text_only_turn_end());
    }

    #[test]
    fn validation_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ValidationStatus::Error).unwrap(),
            "\"error\""
        );
    }

    #[test]
    fn rpc_event_message_update_uses_type_tag_inside_inner_object() {
        let ev = RpcEvent::MessageUpdate {
            assistant_message_event: AssistantMessageEvent {
                kind: MessageUpdateKind::TextDelta,
                delta: Some("hi".into()),
                content_index: Some(0),
                content: None,
            },
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "message_update");
        assert_eq!(json["assistantMessageEvent"]["type"], "text_delta");
        assert_eq!(json["assistantMessageEvent"]["delta"], "hi");
    }

    #[test]
    fn client_event_tool_execution_start_round_trips() {
        let ev = ClientEvent::RpcEvent {
            event: RpcEvent::ToolExecutionStart {
                tool_call_id: "c1".into(),
                tool_name: "write_file".into(),
                args: serde_json::json!({"path": "doc.md"}),
            },
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "rpc_event");
        assert_eq!(json["event"]["type"], "tool_execution_start");
        assert_eq!(json["event"]["toolCallId"], "c1");
        assert_eq!(json["event"]["toolName"], "write_file");
    }

    #[test]
    fn client_command_prompt_deserializes_from_camel_case() {
        let raw = r#"{"type":"change_model","modelId":"m2","provider":"anthropic"}"#;
        let cmd: ClientCommand = serde_json::from_str(raw).unwrap();
        match cmd {
            ClientCommand::ChangeModel { model_id, provider } => {
                assert_eq!(model_id, "m2");
                assert_eq!(provider, "anthropic");
            }
            _ => panic!("wrong variant"),
        }
    }
}
