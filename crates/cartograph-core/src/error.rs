// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session {id} not found under {cwd}")]
    SessionNotFound { id: String, cwd: String },

    #[error("no free port in range {base}..={base_plus_span}")]
    NoFreePort { base: u16, base_plus_span: u16 },

    #[error("agent not ready: {reason}")]
    AgentNotReady { reason: String },

    #[error("{message}")]
    AuthFailure { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("(de)serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
