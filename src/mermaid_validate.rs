// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
//! A real [`DiagramValidator`] that shells out to a mermaid-cli binary.
//!
//! Each call writes the diagram source to a per-attempt temp file, invokes
//! the configured command (`mmdc` by default) against it, and inspects the
//! exit status. Both the input source and the rendered SVG are removed
//! whether the render succeeds or fails — validation is a side-effect-free
//! check from the caller's point of view.

use std::time::Duration;

use async_trait::async_trait;
use cartograph_core::{DiagramCheck, DiagramValidator};
use tempfile::Builder as TempFileBuilder;
use tokio::process::Command;
use tracing::debug;

const VALIDATE_TIMEOUT: Duration = Duration::from_secs(20);

/// Validates mermaid diagram source via an external mermaid-cli command.
pub struct MermaidCliValidator {
    command: Vec<String>,
}

impl MermaidCliValidator {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl DiagramValidator for MermaidCliValidator {
    async fn validate(&self, source: &str) -> DiagramCheck {
        let Some((program, prefix_args)) = self.command.split_first() else {
            return DiagramCheck::Error("validation.mermaid_command is empty".to_string());
        };

        let input = match TempFileBuilder::new().suffix(".mmd").tempfile() {
            Ok(f) => f,
            Err(e) => return DiagramCheck::Error(format!("creating temp input file: {e}")),
        };
        if let Err(e) = tokio::fs::write(input.path(), source).await {
            return DiagramCheck::Error(format!("writing diagram source: {e}"));
        }

        let output_path = input.path().with_extension("svg");

        let mut cmd = Command::new(program);
        cmd.args(prefix_args)
            .arg("-i")
            .arg(input.path())
            .arg("-o")
            .arg(&output_path);

        debug!(?program, "validating mermaid diagram");

        let result = tokio::time::timeout(VALIDATE_TIMEOUT, cmd.output()).await;
        let _ = tokio::fs::remove_file(&output_path).await;
        // `input` (a `NamedTempFile`) deletes its own path on drop.

        match result {
            Ok(Ok(output)) if output.status.success() => DiagramCheck::Ok,
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let message = if stderr.trim().is_empty() {
                    format!("mermaid-cli exited with {}", output.status)
                } else {
                    stderr.trim().to_string()
                };
                DiagramCheck::Error(message)
            }
            Ok(Err(e)) => DiagramCheck::Error(format!("spawning mermaid-cli: {e}")),
            Err(_) => DiagramCheck::Error(format!(
                "mermaid-cli timed out after {}s",
                VALIDATE_TIMEOUT.as_secs()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_command_is_reported_as_error() {
        let validator = MermaidCliValidator::new(vec![]);
        let check = validator.validate("graph TD; A-->B;").await;
        assert!(!check.is_ok());
    }

    #[tokio::test]
    async fn nonexistent_binary_is_reported_as_error() {
        let validator = MermaidCliValidator::new(vec!["cartograph-no-such-mmdc".to_string()]);
        let check = validator.validate("graph TD; A-->B;").await;
        assert!(!check.is_ok());
    }
}
