// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
//! Minimal credential storage for the `auth` subcommand.
//!
//! The engine itself never touches credentials (spec: "the engine itself
//! reads none"); the CLI driver resolves a provider's API key from here (or
//! from its standard environment variable) and hands it to the agent
//! subprocess's environment when spawning it.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;

fn store_path() -> anyhow::Result<PathBuf> {
    let dir = dirs::config_dir()
        .context("no config directory available on this platform")?
        .join("cartograph");
    fs::create_dir_all(&dir)?;
    Ok(dir.join("credentials.json"))
}

fn read_all() -> anyhow::Result<BTreeMap<String, String>> {
    let path = store_path()?;
    match fs::read_to_string(&path) {
        Ok(text) => Ok(serde_json::from_str(&text).unwrap_or_default()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_all(creds: &BTreeMap<String, String>) -> anyhow::Result<()> {
    let path = store_path()?;
    let json = serde_json::to_string_pretty(creds)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::write(&path, json)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        return Ok(());
    }
    #[cfg(not(unix))]
    {
        fs::write(&path, json)?;
        Ok(())
    }
}

pub fn set(provider: &str, key: &str) -> anyhow::Result<()> {
    let mut creds = read_all()?;
    creds.insert(provider.to_string(), key.to_string());
    write_all(&creds)
}

pub fn remove(provider: &str) -> anyhow::Result<bool> {
    let mut creds = read_all()?;
    let removed = creds.remove(provider).is_some();
    if removed {
        write_all(&creds)?;
    }
    Ok(removed)
}

pub fn list() -> anyhow::Result<Vec<String>> {
    Ok(read_all()?.into_keys().collect())
}

pub fn get(provider: &str) -> anyhow::Result<Option<String>> {
    Ok(read_all()?.remove(provider))
}

/// Resolve a provider's API key: `CARTOGRAPH_<PROVIDER>_API_KEY` in the
/// environment takes priority, falling back to the stored credential.
pub fn resolve_env(provider: &str) -> anyhow::Result<Option<String>> {
    let var_name = format!("CARTOGRAPH_{}_API_KEY", provider.to_uppercase());
    if let Ok(value) = std::env::var(&var_name) {
        return Ok(Some(value));
    }
    get(provider)
}
