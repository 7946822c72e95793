// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::events::{AgentEvent, ContentBlock, FailureClass};

/// Speaker of one entry in the agent's full message log, as returned by
/// [`AgentRuntime::messages`]. Broader than the wire [`crate::events::Role`]
/// because the raw log also carries system and tool-result turns that chat
/// extraction (§4.5) filters out before they ever reach the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub role: TranscriptRole,
    pub content: Vec<ContentBlock>,
}

impl RawMessage {
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self.content.iter().filter_map(ContentBlock::text).collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(""))
        }
    }

    pub fn is_tool_only(&self) -> bool {
        !self.content.is_empty() && self.content.iter().all(ContentBlock::is_tool)
    }
}

/// The engine's only view of the agent. Real implementations drive an
/// in-process, subprocess, or remote model session; [`FakeAgentRuntime`]
/// drives deterministic tests.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Deliver a user message. `steer = true` means mid-turn guidance that
    /// does not end the current turn (see §4.4).
    async fn prompt(&self, text: String, steer: bool) -> anyhow::Result<()>;

    /// Ask the current turn to stop as soon as possible.
    async fn abort(&self);

    async fn set_model(&self, model: String, provider: String) -> anyhow::Result<()>;

    /// Subscribe to this runtime's event stream. Dropping the receiver
    /// unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<AgentEvent>;

    /// The full message log (system + user + assistant), oldest first.
    fn messages(&self) -> Vec<RawMessage>;
}

/// Classify a raw error message from the agent runtime into a [`FailureClass`].
/// Auth-shaped failures are permanent; the listed transient statuses and
/// socket-level errors go through crash-restart; anything else is `Unknown`
/// and is treated as transient (see the crash-classification open question).
pub fn classify_failure(message: &str) -> FailureClass {
    let lower = message.to_lowercase();

    const AUTH_MARKERS: &[&str] = &["no api key", "authentication", "no model"];
    if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        return FailureClass::Auth;
    }

    const TRANSIENT_STATUSES: &[&str] = &["429", "500", "502", "503", "504", "529"];
    const TRANSIENT_MARKERS: &[&str] = &[
        "connection reset",
        "econnreset",
        "socket",
        "timed out",
        "timeout",
        "broken pipe",
    ];
    if TRANSIENT_STATUSES.iter().any(|s| lower.contains(s))
        || TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
    {
        return FailureClass::Transient;
    }

    FailureClass::Unknown
}

/// A scriptable [`AgentRuntime`] for tests: records calls, emits events on
/// demand, and returns a fixed message log.
pub struct FakeAgentRuntime {
    tx: broadcast::Sender<AgentEvent>,
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    prompts: Vec<(String, bool)>,
    aborts: u32,
    model: Option<(String, String)>,
    messages: Vec<RawMessage>,
}

impl FakeAgentRuntime {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            tx,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn with_messages(messages: Vec<RawMessage>) -> Self {
        let runtime = Self::new();
        runtime.state.lock().unwrap().messages = messages;
        runtime
    }

    /// Push an event as if the underlying model session produced it.
    pub fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }

    pub fn prompts(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().prompts.clone()
    }

    pub fn abort_count(&self) -> u32 {
        self.state.lock().unwrap().aborts
    }

    pub fn current_model(&self) -> Option<(String, String)> {
        self.state.lock().unwrap().model.clone()
    }
}

impl Default for FakeAgentRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRuntime for FakeAgentRuntime {
    async fn prompt(&self, text: String, steer: bool) -> anyhow::Result<()> {
        self.state.lock().unwrap().prompts.push((text, steer));
        Ok(())
    }

    async fn abort(&self) {
        self.state.lock().unwrap().aborts += 1;
    }

    async fn set_model(&self, model: String, provider: String) -> anyhow::Result<()> {
        self.state.lock().unwrap().model = Some((model, provider));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    fn messages(&self) -> Vec<RawMessage> {
        self.state.lock().unwrap().messages.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_auth_markers() {
        assert_eq!(classify_failure("No API key configured"), FailureClass::Auth);
        assert_eq!(
            classify_failure("Authentication failed for provider"),
            FailureClass::Auth
        );
        assert_eq!(classify_failure("no model selected"), FailureClass::Auth);
    }

    #[test]
    fn classify_transient_statuses_and_sockets() {
        for msg in ["HTTP 429 too many requests", "upstream 503", "got 529 overloaded"] {
            assert_eq!(classify_failure(msg), FailureClass::Transient, "{msg}");
        }
        assert_eq!(
            classify_failure("connection reset by peer"),
            FailureClass::Transient
        );
    }

    #[test]
    fn classify_unknown_for_unrecognized_message() {
        assert_eq!(classify_failure("the sky is falling"), FailureClass::Unknown);
    }

    #[tokio::test]
    async fn fake_runtime_records_prompts_and_aborts() {
        let runtime = FakeAgentRuntime::new();
        runtime.prompt("hello".into(), false).await.unwrap();
        runtime.prompt("steer this".into(), true).await.unwrap();
        runtime.abort().await;
        assert_eq!(
            runtime.prompts(),
            vec![("hello".to_string(), false), ("steer this".to_string(), true)]
        );
        assert_eq!(runtime.abort_count(), 1);
    }

    #[tokio::test]
    async fn fake_runtime_subscribers_receive_emitted_events() {
        let runtime = FakeAgentRuntime::new();
        let mut rx = runtime.subscribe();
        runtime.emit(AgentEvent::AgentStart);
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev, AgentEvent::AgentStart));
    }

    #[tokio::test]
    async fn fake_runtime_set_model_updates_current_model() {
        let runtime = FakeAgentRuntime::new();
        runtime.set_model("m2".into(), "anthropic".into()).await.unwrap();
        assert_eq!(
            runtime.current_model(),
            Some(("m2".to_string(), "anthropic".to_string()))
        );
    }
}
