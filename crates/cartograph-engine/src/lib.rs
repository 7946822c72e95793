// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
pub mod engine;
pub mod http;
pub mod hub;
pub mod supervisor;
pub mod validation;
pub mod ws;

pub use engine::{
    ClosureSessionFactory, Engine, EngineConfig, PublicState, SessionFactory, StartedSession,
};
pub use hub::{ClientId, ClientSink, ClientStream, EventHub};
pub use supervisor::{
    extract_chat_history, AgentSupervisor, ChatDispatch, CrashOutcome, EventOutcome, Phase,
    FORMATTING_SUFFIX, RECENT_CHAT_LIMIT,
};
pub use validation::{
    extract_diagrams, synthesize_fix_prompt, validate_all, AfterComplete, DiagramFailure,
    ValidationLoop, ValidationState,
};
