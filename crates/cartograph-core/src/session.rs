// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One exploration session, as held in memory by the engine.
#[derive(Debug, Clone)]
pub struct Session {
    /// 8 hex characters.
    pub id: String,
    pub cwd: PathBuf,
    pub target_path: PathBuf,
    pub focus: Option<String>,
    pub scope: Option<Vec<String>>,
    pub depth: String,
    pub model: String,
    pub provider: String,
    pub html_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub secret: String,
    pub timestamp: DateTime<Utc>,
}

impl Session {
    pub fn new_id() -> String {
        let mut bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    pub fn to_meta(&self) -> SessionMeta {
        SessionMeta {
            id: self.id.clone(),
            target_path: self.target_path.clone(),
            prompt: self.focus.clone(),
            scope: self.scope.clone(),
            depth: self.depth.clone(),
            model: self.model.clone(),
            html_path: self.html_path.clone(),
            session_file: None,
            port: self.port,
            timestamp: self.timestamp,
        }
    }

    pub fn session_dir(&self, local_dir: &str) -> PathBuf {
        session_dir(&self.target_path, local_dir, &self.id)
    }
}

/// The subset of [`Session`] persisted to `meta.json`. Deliberately narrower
/// than `Session`: the secret, cwd and provider are never written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub target_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scope: Option<Vec<String>>,
    pub depth: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub html_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub port: Option<u16>,
    pub timestamp: DateTime<Utc>,
}

fn session_dir(target_path: &Path, local_dir: &str, id: &str) -> PathBuf {
    target_path.join(local_dir).join(id)
}

/// Write `meta` to `<target_path>/<local_dir>/<id>/meta.json`.
pub fn save(meta: &SessionMeta, local_dir: &str) -> std::io::Result<()> {
    let dir = session_dir(&meta.target_path, local_dir, &meta.id);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("meta.json");
    let json = serde_json::to_string_pretty(meta)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, json)
}

/// Load a single session's metadata by id.
pub fn load(target_path: &Path, local_dir: &str, id: &str) -> std::io::Result<SessionMeta> {
    let path = session_dir(target_path, local_dir, id).join("meta.json");
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Enumerate every persisted session under `<target_path>/<local_dir>/`.
/// Entries whose `meta.json` is missing or unparsable are skipped with a
/// warning rather than failing the whole scan.
pub fn load_local_sessions(target_path: &Path, local_dir: &str) -> Vec<SessionMeta> {
    let root = target_path.join(local_dir);
    let Ok(entries) = std::fs::read_dir(&root) else {
        return Vec::new();
    };

    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let Some(id) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        match load(target_path, local_dir, &id) {
            Ok(meta) => sessions.push(meta),
            Err(e) => debug!(id = %id, error = %e, "skipping unreadable session directory"),
        }
    }
    sessions
}

/// Contents of the `.pid` file written at `start` and consulted by
/// `stopExternal`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidFile {
    pub pid: u32,
    pub port: u16,
    pub ts: DateTime<Utc>,
}

fn pid_file_path(cwd: &Path, local_dir: &str) -> PathBuf {
    cwd.join(local_dir).join(".pid")
}

pub fn write_pid_file(cwd: &Path, local_dir: &str, port: u16, ts: DateTime<Utc>) -> std::io::Result<()> {
    let path = pid_file_path(cwd, local_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = PidFile {
        pid: std::process::id(),
        port,
        ts,
    };
    let json = serde_json::to_string(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, json)
}

/// Read the pid file, signal the owning process with SIGTERM, and remove the
/// file. Returns `true` iff a pid file was found and a process was signalled.
pub fn stop_external(cwd: &Path, local_dir: &str) -> std::io::Result<bool> {
    let path = pid_file_path(cwd, local_dir);
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let Ok(file) = serde_json::from_str::<PidFile>(&text) else {
        warn!(path = %path.display(), "pid file contents unreadable, removing");
        std::fs::remove_file(&path).ok();
        return Ok(false);
    };

    signal_terminate(file.pid);
    std::fs::remove_file(&path)?;
    Ok(true)
}

#[cfg(unix)]
fn signal_terminate(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) {}
