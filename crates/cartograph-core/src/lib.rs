// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
pub mod clock;
pub mod collaborators;
pub mod cost;
pub mod error;
pub mod events;
pub mod runtime;
pub mod session;

pub use clock::{restart_delay, Clock, ManualClock, SystemClock};
pub use collaborators::{DiagramCheck, DiagramValidator, FakeDiagramValidator, FakeMarkdownRenderer, MarkdownRenderer};
pub use cost::{CostEntry, CostTracker};
pub use error::EngineError;
pub use events::{
    AgentEvent, AgentFailure, ChatMessage, ClientCommand, ClientEvent, ContentBlock, CostSnapshot,
    FailureClass, MessageUpdateKind, Role, RpcEvent, Usage, ValidationStatus,
};
pub use runtime::{classify_failure, AgentRuntime, FakeAgentRuntime, RawMessage, TranscriptRole};
pub use session::{load, load_local_sessions, save, stop_external, write_pid_file, PidFile, Session, SessionMeta};
