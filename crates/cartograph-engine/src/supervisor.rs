// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
//! Agent phase state machine: lifecycle, crash-restart with backoff, the
//! health watchdog, steering/new-turn dispatch, and chat-history extraction.
//!
//! Pure state, no I/O: every method takes what it needs (an event, an
//! `Instant`, a message) and returns what happened so the async driver in
//! `engine.rs` can act on it (broadcast to the hub, schedule a restart timer,
//! call into the `AgentRuntime`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use cartograph_core::{
    restart_delay, AgentEvent, AgentFailure, AssistantMessageEvent, ChatMessage, ClientEvent,
    ContentBlock, FailureClass, MessageEndInfo, MessageStartInfo, MessageUpdateKind, RawMessage,
    Role, RpcEvent, TranscriptRole, Usage,
};

/// The formatting instruction appended to every user-typed prompt before it
/// reaches the agent; stripped back off on the chat-history display path.
pub const FORMATTING_SUFFIX: &str =
    "\n\n(Respond in GitHub-flavored markdown; use fenced mermaid blocks for diagrams.)";

/// How many of the most recent chat entries are pushed on client connect,
/// before a `load_history` request asks for the rest.
pub const RECENT_CHAT_LIMIT: usize = 20;

/// Tool names whose `path` argument, if it ends in `.md`, marks a document
/// write worth tracking through to its matching `tool_execution_end`.
const MARKDOWN_WRITE_TOOLS: &[&str] = &["write_file", "edit_file"];

const TOOL_RESULT_LIMIT: usize = 10_000;
const TOOL_RESULT_TRUNCATION_SUFFIX: &str = "...[truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Streaming,
    Waiting,
    Restarting,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatDispatch {
    /// Streaming: deliver as mid-turn guidance, current turn keeps running.
    Steer,
    /// Waiting: starts a new turn; phase moves to `streaming` on the next
    /// `agent_start`.
    NewTurn,
    /// Stopped, failed, or the agent isn't ready yet.
    Rejected,
}

/// What a single crash produced.
#[derive(Debug, Clone)]
pub struct CrashOutcome {
    pub client_events: Vec<ClientEvent>,
    pub will_restart: bool,
    pub restart_delay: Option<Duration>,
    /// Set when this crash moved the phase to [`Phase::Failed`] (auth failure,
    /// or crash-restart budget exhausted). The caller must fail any pending
    /// readiness wait rather than let it hang forever.
    pub became_failed: bool,
}

/// What processing a single [`AgentEvent`] produced.
#[derive(Debug, Clone, Default)]
pub struct EventOutcome {
    pub client_events: Vec<ClientEvent>,
    pub ready_fired: bool,
    pub turn_ended: bool,
    /// Set when a tracked markdown write completed successfully; the caller
    /// should render it and feed the result into the validation loop.
    pub doc_write_detected: Option<PathBuf>,
    pub usage: Option<Usage>,
    /// Set when a crash was classified as transient/unknown and a restart is
    /// scheduled; the caller owns the actual timer.
    pub restart_delay: Option<Duration>,
    /// Set (to the triggering error message) when an `AgentEvent::Error`
    /// moved the phase to [`Phase::Failed`] before the agent ever became
    /// ready, i.e. readiness can never fire on its own now.
    pub terminally_failed: Option<String>,
}

pub struct AgentSupervisor {
    phase: Phase,
    crash_count: u32,
    intentional_stop: bool,
    onready_fired: bool,
    max_crash_restarts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    health_timeout: Duration,
    consecutive_health_failures: u32,
    last_activity: Option<Instant>,
    pending_tool_writes: HashMap<String, PathBuf>,
}

impl AgentSupervisor {
    pub fn new(max_crash_restarts: u32, backoff_base: Duration, backoff_max: Duration, health_timeout: Duration) -> Self {
        Self {
            phase: Phase::Idle,
            crash_count: 0,
            intentional_stop: false,
            onready_fired: false,
            max_crash_restarts,
            backoff_base,
            backoff_max,
            health_timeout,
            consecutive_health_failures: 0,
            last_activity: None,
            pending_tool_writes: HashMap::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn crash_count(&self) -> u32 {
        self.crash_count
    }

    pub fn is_intentional_stop(&self) -> bool {
        self.intentional_stop
    }

    pub fn consecutive_health_failures(&self) -> u32 {
        self.consecutive_health_failures
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_health_failures == 0
    }

    /// `idle → starting`, and clears a prior `intentionalStop`.
    pub fn start(&mut self) {
        self.intentional_stop = false;
        self.phase = Phase::Starting;
    }

    fn record_activity(&mut self, now: Instant) -> Option<ClientEvent> {
        self.last_activity = Some(now);
        if self.consecutive_health_failures > 0 {
            self.consecutive_health_failures = 0;
            Some(ClientEvent::AgentHealth {
                healthy: true,
                failures: None,
                silent_ms: None,
                restored: Some(true),
            })
        } else {
            None
        }
    }

    fn end_turn_if_needed(&mut self) -> bool {
        if self.phase == Phase::Streaming {
            self.phase = Phase::Waiting;
            true
        } else {
            false
        }
    }

    /// Feed one event from the agent runtime's subscription into the state
    /// machine. Idempotent with respect to turn-end: a native `agent_end`
    /// and a text-only-turn heuristic both call [`Self::end_turn_if_needed`],
    /// so only the first of the two actually flips the phase.
    pub fn on_agent_event(&mut self, event: AgentEvent, now: Instant) -> EventOutcome {
        let mut outcome = EventOutcome::default();
        if self.intentional_stop {
            return outcome;
        }

        if let Some(restored) = self.record_activity(now) {
            outcome.client_events.push(restored);
        }

        match event {
            AgentEvent::AgentStart => {
                if matches!(self.phase, Phase::Starting | Phase::Restarting | Phase::Waiting) {
                    self.phase = Phase::Streaming;
                }
                self.crash_count = 0;
                if !self.onready_fired {
                    self.onready_fired = true;
                    outcome.ready_fired = true;
                }
                outcome
                    .client_events
                    .push(ClientEvent::RpcEvent { event: RpcEvent::AgentStart });
            }
            AgentEvent::AgentEnd => {
                if self.end_turn_if_needed() {
                    outcome.turn_ended = true;
                    outcome
                        .client_events
                        .push(ClientEvent::RpcEvent { event: RpcEvent::AgentEnd });
                }
            }
            AgentEvent::MessageStart { role } => {
                outcome.client_events.push(ClientEvent::RpcEvent {
                    event: RpcEvent::MessageStart {
                        message: MessageStartInfo { role },
                    },
                });
            }
            AgentEvent::MessageUpdate { kind, delta, content_index, content } => {
                outcome.client_events.push(ClientEvent::RpcEvent {
                    event: RpcEvent::MessageUpdate {
                        assistant_message_event: AssistantMessageEvent {
                            kind,
                            delta,
                            content_index,
                            content,
                        },
                    },
                });
                if kind == MessageUpdateKind::TextEnd {
                    outcome
                        .client_events
                        .push(ClientEvent::RpcEvent { event: RpcEvent::TextDone });
                }
            }
            AgentEvent::MessageEnd { role, content, usage } => {
                let is_text_only_turn_end =
                    role == Role::Assistant && !content.is_empty() && content.iter().all(|b| !b.is_tool());
                let text = content
                    .iter()
                    .filter_map(ContentBlock::text)
                    .collect::<Vec<_>>()
                    .join("");

                outcome.client_events.push(ClientEvent::RpcEvent {
                    event: RpcEvent::MessageEnd {
                        message: MessageEndInfo { role, text, usage },
                    },
                });
                outcome.usage = usage;

                if is_text_only_turn_end && self.end_turn_if_needed() {
                    outcome.turn_ended = true;
                    outcome
                        .client_events
                        .push(ClientEvent::RpcEvent { event: RpcEvent::AgentEnd });
                }
            }
            AgentEvent::ToolExecutionStart { id, name, args } => {
                if let Some(path) = extract_markdown_path(&name, &args) {
                    self.pending_tool_writes.insert(id.clone(), path);
                }
                outcome.client_events.push(ClientEvent::RpcEvent {
                    event: RpcEvent::ToolExecutionStart { tool_call_id: id, tool_name: name, args },
                });
            }
            AgentEvent::ToolExecutionEnd { id, name, result, is_error } => {
                if is_error {
                    self.pending_tool_writes.remove(&id);
                } else if let Some(path) = self.pending_tool_writes.remove(&id) {
                    outcome.doc_write_detected = Some(path);
                }
                outcome.client_events.push(ClientEvent::RpcEvent {
                    event: RpcEvent::ToolExecutionEnd {
                        tool_call_id: id,
                        tool_name: name,
                        result: truncate_result(&result),
                        is_error,
                    },
                });
            }
            AgentEvent::ToolExecutionUpdate { .. } => {}
            AgentEvent::AutoCompactionStart
            | AgentEvent::AutoCompactionEnd
            | AgentEvent::AutoRetryStart
            | AgentEvent::AutoRetryEnd => {}
            AgentEvent::Error(AgentFailure { message, .. }) => {
                let crash = self.handle_crash(message.clone());
                outcome.restart_delay = crash.restart_delay;
                if crash.became_failed {
                    outcome.terminally_failed = Some(message);
                }
                outcome.client_events.extend(crash.client_events);
            }
        }

        outcome
    }

    /// Classify and record a crash, whether observed via [`AgentEvent::Error`]
    /// or a direct failure from `prompt()`/the session factory.
    pub fn handle_crash(&mut self, message: impl Into<String>) -> CrashOutcome {
        if self.intentional_stop {
            return CrashOutcome {
                client_events: Vec::new(),
                will_restart: false,
                restart_delay: None,
                became_failed: false,
            };
        }

        let message = message.into();
        let class = cartograph_core::classify_failure(&message);
        self.crash_count += 1;

        if class == FailureClass::Auth {
            self.phase = Phase::Failed;
            return CrashOutcome {
                client_events: vec![ClientEvent::AgentExit {
                    error: message,
                    crash_count: self.crash_count,
                    will_restart: false,
                    restart_in: None,
                }],
                will_restart: false,
                restart_delay: None,
                became_failed: true,
            };
        }

        if self.crash_count <= self.max_crash_restarts {
            let delay = restart_delay(self.crash_count, self.backoff_base, self.backoff_max);
            self.phase = Phase::Restarting;
            CrashOutcome {
                client_events: vec![
                    ClientEvent::AgentExit {
                        error: message,
                        crash_count: self.crash_count,
                        will_restart: true,
                        restart_in: Some(delay.as_millis() as u64),
                    },
                    ClientEvent::AgentRestarting {
                        attempt: self.crash_count,
                        max_attempts: self.max_crash_restarts,
                        restart_in: delay.as_millis() as u64,
                    },
                ],
                will_restart: true,
                restart_delay: Some(delay),
                became_failed: false,
            }
        } else {
            self.phase = Phase::Failed;
            CrashOutcome {
                client_events: vec![ClientEvent::AgentExit {
                    error: message,
                    crash_count: self.crash_count,
                    will_restart: false,
                    restart_in: None,
                }],
                will_restart: false,
                restart_delay: None,
                became_failed: true,
            }
        }
    }

    /// Run the health watchdog tick. Only meaningful while streaming; the
    /// watchdog is not paused during long tool invocations (an open
    /// question carried from the originating design, see DESIGN.md).
    pub fn health_tick(&mut self, now: Instant) -> Option<ClientEvent> {
        if self.phase != Phase::Streaming || self.intentional_stop {
            return None;
        }
        let last = self.last_activity?;
        let silence = now.saturating_duration_since(last);
        if silence > self.health_timeout {
            self.consecutive_health_failures += 1;
            Some(ClientEvent::AgentHealth {
                healthy: false,
                failures: Some(self.consecutive_health_failures),
                silent_ms: Some(silence.as_millis() as u64),
                restored: None,
            })
        } else {
            None
        }
    }

    /// Where a `prompt{text}` from a client should go given the current
    /// phase (§4.4).
    pub fn dispatch_chat(&self) -> ChatDispatch {
        match self.phase {
            Phase::Streaming => ChatDispatch::Steer,
            Phase::Waiting => ChatDispatch::NewTurn,
            _ => ChatDispatch::Rejected,
        }
    }

    /// `abort` while streaming flips to waiting and ends the turn; a no-op
    /// otherwise.
    pub fn handle_abort(&mut self) -> Option<ClientEvent> {
        if self.phase == Phase::Streaming {
            self.phase = Phase::Waiting;
            Some(ClientEvent::RpcEvent { event: RpcEvent::AgentEnd })
        } else {
            None
        }
    }

    /// Marks `intentionalStop`, clears pending tool-write tracking, and
    /// returns the `agent_stopped` event to broadcast. The caller is
    /// responsible for instructing the runtime to abort, unsubscribing, and
    /// resetting the validation loop and hub history (those belong to other
    /// components).
    pub fn stop(&mut self) -> ClientEvent {
        self.intentional_stop = true;
        self.phase = Phase::Stopped;
        self.pending_tool_writes.clear();
        ClientEvent::AgentStopped
    }
}

fn extract_markdown_path(tool_name: &str, args: &serde_json::Value) -> Option<PathBuf> {
    if !MARKDOWN_WRITE_TOOLS.contains(&tool_name) {
        return None;
    }
    let path = args.get("path")?.as_str()?;
    if path.ends_with(".md") {
        Some(PathBuf::from(path))
    } else {
        None
    }
}

fn truncate_result(result: &str) -> String {
    if result.chars().count() <= TOOL_RESULT_LIMIT {
        result.to_string()
    } else {
        let mut truncated: String = result.chars().take(TOOL_RESULT_LIMIT).collect();
        truncated.push_str(TOOL_RESULT_TRUNCATION_SUFFIX);
        truncated
    }
}

fn strip_formatting_suffix(text: &str) -> &str {
    text.strip_suffix(FORMATTING_SUFFIX).unwrap_or(text)
}

/// Filter a runtime's full message log down to the user/assistant turns a
/// browser transcript should show, per §4.5. `limit` trims to the last N
/// emitted entries when given (`None` returns the full filtered sequence).
pub fn extract_chat_history(messages: &[RawMessage], limit: Option<usize>) -> Vec<ChatMessage> {
    let mut out = Vec::new();
    let mut skipped_first_user = false;
    let mut last_emitted_role: Option<Role> = None;

    for message in messages {
        match message.role {
            TranscriptRole::System => continue,
            TranscriptRole::User => {
                if !skipped_first_user {
                    skipped_first_user = true;
                    continue;
                }
                let Some(text) = message.text() else { continue };
                out.push(ChatMessage {
                    role: Role::User,
                    text: strip_formatting_suffix(&text).to_string(),
                });
                last_emitted_role = Some(Role::User);
            }
            TranscriptRole::Assistant => {
                if message.is_tool_only() {
                    continue;
                }
                let Some(text) = message.text() else { continue };
                if last_emitted_role == Some(Role::User) {
                    out.push(ChatMessage { role: Role::Assistant, text });
                    last_emitted_role = Some(Role::Assistant);
                }
            }
        }
    }

    match limit {
        Some(limit) if out.len() > limit => out.split_off(out.len() - limit),
        _ => out,
    }
}
