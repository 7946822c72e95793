// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
//! A real [`AgentRuntime`] backed by an external coding-agent subprocess.
//!
//! The engine never talks to a model API directly (that boundary is the
//! `AgentRuntime` trait); this module is the CLI driver's concrete choice of
//! backend: spawn `config.agent.command`, write newline-delimited JSON
//! commands to its stdin, and translate its newline-delimited JSON event
//! stream on stdout into [`AgentEvent`]s. The wire shape reuses
//! `cartograph_core`'s own `Role`/`ContentBlock`/`Usage`/`MessageUpdateKind`
//! types, which already derive `Serialize`/`Deserialize`.

use std::process::Stdio;
use std::sync::Mutex as StdMutex;

use anyhow::Context;
use async_trait::async_trait;
use cartograph_core::{
    classify_failure, AgentEvent, AgentFailure, AgentRuntime, ContentBlock, MessageUpdateKind,
    RawMessage, Role, TranscriptRole, Usage,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    AgentStart,
    AgentEnd,
    MessageStart {
        role: Role,
    },
    MessageUpdate {
        kind: MessageUpdateKind,
        #[serde(default)]
        delta: Option<String>,
        #[serde(default)]
        content_index: Option<usize>,
        #[serde(default)]
        content: Option<String>,
    },
    MessageEnd {
        role: Role,
        content: Vec<ContentBlock>,
        #[serde(default)]
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
    Error {
        message: String,
    },
}

impl From<WireEvent> for AgentEvent {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::AgentStart => AgentEvent::AgentStart,
            WireEvent::AgentEnd => AgentEvent::AgentEnd,
            WireEvent::MessageStart { role } => AgentEvent::MessageStart { role },
            WireEvent::MessageUpdate { kind, delta, content_index, content } => {
                AgentEvent::MessageUpdate { kind, delta, content_index, content }
            }
            WireEvent::MessageEnd { role, content, usage } => {
                AgentEvent::MessageEnd { role, content, usage }
            }
            WireEvent::ToolExecutionStart { id, name, args } => {
                AgentEvent::ToolExecutionStart { id, name, args }
            }
            WireEvent::ToolExecutionEnd { id, name, result, is_error } => {
                AgentEvent::ToolExecutionEnd { id, name, result, is_error }
            }
            WireEvent::ToolExecutionUpdate { id, name } => AgentEvent::ToolExecutionUpdate { id, name },
            WireEvent::AutoCompactionStart => AgentEvent::AutoCompactionStart,
            WireEvent::AutoCompactionEnd => AgentEvent::AutoCompactionEnd,
            WireEvent::AutoRetryStart => AgentEvent::AutoRetryStart,
            WireEvent::AutoRetryEnd => AgentEvent::AutoRetryEnd,
            WireEvent::Error { message } => {
                let class = classify_failure(&message);
                AgentEvent::Error(AgentFailure { message, class })
            }
        }
    }
}

/// A command written to the subprocess's stdin.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireCommand {
    Prompt { text: String, steer: bool },
    Abort,
    SetModel { model: String, provider: String },
}

struct Inner {
    child: StdMutex<Child>,
    stdin: AsyncMutex<ChildStdin>,
    tx: broadcast::Sender<AgentEvent>,
    messages: StdMutex<Vec<RawMessage>>,
}

/// Drives an external coding-agent process as the engine's [`AgentRuntime`].
pub struct SubprocessAgentRuntime {
    inner: std::sync::Arc<Inner>,
}

impl SubprocessAgentRuntime {
    /// Spawn `command` (argv, first element is the binary) with `cwd` as its
    /// working directory and `env` additionally set (typically the
    /// resolved provider API key), then start the background reader task.
    pub async fn spawn(
        command: &[String],
        cwd: &std::path::Path,
        env: &[(String, String)],
    ) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .context("agent.command must not be empty")?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning agent process '{program}'"))?;

        let stdin = child.stdin.take().context("agent process has no stdin")?;
        let stdout = child.stdout.take().context("agent process has no stdout")?;

        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = std::sync::Arc::new(Inner {
            child: StdMutex::new(child),
            stdin: AsyncMutex::new(stdin),
            tx,
            messages: StdMutex::new(Vec::new()),
        });

        let reader_inner = inner.clone();
        tokio::spawn(async move { read_events(stdout, reader_inner).await });

        Ok(Self { inner })
    }

    async fn send_command(&self, command: WireCommand) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&command)?;
        line.push('\n');
        let mut guard = self.inner.stdin.lock().await;
        guard.write_all(line.as_bytes()).await?;
        guard.flush().await?;
        Ok(())
    }
}

async fn read_events(stdout: tokio::process::ChildStdout, inner: std::sync::Arc<Inner>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WireEvent>(trimmed) {
                    Ok(wire) => {
                        if let WireEvent::MessageEnd { role, content, .. } = &wire {
                            record_message(&inner, *role, content.clone());
                        }
                        let _ = inner.tx.send(wire.into());
                    }
                    Err(e) => warn!(error = %e, line = trimmed, "dropping unparsable agent event"),
                }
            }
            Ok(None) => {
                debug!("agent process closed stdout");
                break;
            }
            Err(e) => {
                warn!(error = %e, "error reading agent stdout");
                break;
            }
        }
    }
}

fn record_message(inner: &Inner, role: Role, content: Vec<ContentBlock>) {
    let transcript_role = match role {
        Role::User => TranscriptRole::User,
        Role::Assistant => TranscriptRole::Assistant,
    };
    inner
        .messages
        .lock()
        .expect("messages mutex poisoned")
        .push(RawMessage { role: transcript_role, content });
}

#[async_trait]
impl AgentRuntime for SubprocessAgentRuntime {
    async fn prompt(&self, text: String, steer: bool) -> anyhow::Result<()> {
        record_message(
            &self.inner,
            Role::User,
            vec![ContentBlock::Text { text: text.clone() }],
        );
        self.send_command(WireCommand::Prompt { text, steer }).await
    }

    async fn abort(&self) {
        let _ = self.send_command(WireCommand::Abort).await;
    }

    async fn set_model(&self, model: String, provider: String) -> anyhow::Result<()> {
        self.send_command(WireCommand::SetModel { model, provider }).await
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.inner.tx.subscribe()
    }

    fn messages(&self) -> Vec<RawMessage> {
        self.inner.messages.lock().expect("messages mutex poisoned").clone()
    }
}

impl Drop for SubprocessAgentRuntime {
    fn drop(&mut self) {
        if let Ok(mut child) = self.inner.child.lock() {
            let _ = child.start_kill();
        }
    }
}
