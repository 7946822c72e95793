// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_local_dir() -> String {
    ".cartograph".to_string()
}

fn default_base_port() -> u16 {
    4173
}

fn default_port_probe_span() -> u16 {
    10
}

fn default_max_crash_restarts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_max_ms() -> u64 {
    15_000
}

fn default_health_check_interval_ms() -> u64 {
    15_000
}

fn default_health_silence_timeout_ms() -> u64 {
    10_000
}

fn default_max_validation_attempts() -> u32 {
    3
}

fn default_recent_chat_limit() -> usize {
    20
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_agent_command() -> Vec<String> {
    vec!["cartograph-agent".to_string()]
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_mermaid_command() -> Vec<String> {
    vec!["mmdc".to_string()]
}

fn default_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo { id: "claude-opus-4-1".to_string(), provider: "anthropic".to_string() },
        ModelInfo { id: "claude-sonnet-4-5".to_string(), provider: "anthropic".to_string() },
        ModelInfo { id: "claude-haiku-4-5".to_string(), provider: "anthropic".to_string() },
    ]
}

/// Top-level engine configuration, loaded by [`crate::load`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            supervisor: SupervisorConfig::default(),
            validation: ValidationConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

/// Wiring for the external coding-agent process the engine supervises.
/// The engine only ever talks to this process through the `AgentRuntime`
/// trait (cartograph-core); this config just tells the CLI driver which
/// binary to spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Argv of the agent subprocess, e.g. `["claude-agent", "--jsonl"]`.
    /// The binary is expected to read newline-delimited JSON commands on
    /// stdin and emit newline-delimited JSON agent events on stdout.
    #[serde(default = "default_agent_command")]
    pub command: Vec<String>,
    /// Model id used when the operator doesn't pass `--model`.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Provider id paired with `default_model`.
    #[serde(default = "default_provider")]
    pub default_provider: String,
    /// Static model registry surfaced at `/models`, with an `active` flag
    /// computed against the session's current model/provider.
    #[serde(default = "default_models")]
    pub models: Vec<ModelInfo>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            default_model: default_model(),
            default_provider: default_provider(),
            models: default_models(),
        }
    }
}

/// One entry in the static model registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
}

/// HTTP/WebSocket server knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// First port tried when binding the loopback listener.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// How many ports above `base_port` to try before giving up.
    #[serde(default = "default_port_probe_span")]
    pub port_probe_span: u16,
    /// Directory name (relative to the session's target path) that holds
    /// session metadata and the pid file.
    #[serde(default = "default_local_dir")]
    pub local_dir: String,
    /// Interval between `heartbeat` broadcasts while clients are connected.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            port_probe_span: default_port_probe_span(),
            local_dir: default_local_dir(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

/// Agent supervisor knobs (crash restart, health watchdog).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_max_crash_restarts")]
    pub max_crash_restarts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_health_silence_timeout_ms")]
    pub health_silence_timeout_ms: u64,
    #[serde(default = "default_recent_chat_limit")]
    pub recent_chat_limit: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_crash_restarts: default_max_crash_restarts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_silence_timeout_ms: default_health_silence_timeout_ms(),
            recent_chat_limit: default_recent_chat_limit(),
        }
    }
}

/// Diagram validation fix-loop knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_max_validation_attempts")]
    pub max_attempts: u32,
    /// Whether the fix-loop is enabled at all (disabling it is useful for
    /// exploration prompts that never produce mermaid diagrams).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Argv prefix of the mermaid CLI used to validate one diagram's
    /// source, e.g. `["mmdc"]` (mermaid-cli). The validator appends
    /// `-i <tempfile> -o <tempfile>` itself.
    #[serde(default = "default_mermaid_command")]
    pub mermaid_command: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_validation_attempts(),
            enabled: true,
            mermaid_command: default_mermaid_command(),
        }
    }
}

/// Exploration depth requested by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    Shallow,
    Medium,
    Deep,
}

impl Default for Depth {
    fn default() -> Self {
        Depth::Medium
    }
}

impl std::str::FromStr for Depth {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shallow" => Ok(Depth::Shallow),
            "medium" => Ok(Depth::Medium),
            "deep" => Ok(Depth::Deep),
            other => Err(anyhow::anyhow!(
                "invalid depth '{other}': expected shallow, medium, or deep"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_defaults_to_medium() {
        assert_eq!(Depth::default(), Depth::Medium);
    }

    #[test]
    fn depth_parses_from_str() {
        assert_eq!("shallow".parse::<Depth>().unwrap(), Depth::Shallow);
        assert_eq!("deep".parse::<Depth>().unwrap(), Depth::Deep);
        assert!("bogus".parse::<Depth>().is_err());
    }

    #[test]
    fn config_default_matches_documented_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.server.base_port, 4173);
        assert_eq!(cfg.server.port_probe_span, 10);
        assert_eq!(cfg.supervisor.max_crash_restarts, 5);
        assert_eq!(cfg.supervisor.backoff_base_ms, 2_000);
        assert_eq!(cfg.supervisor.backoff_max_ms, 15_000);
        assert_eq!(cfg.validation.max_attempts, 3);
    }
}
