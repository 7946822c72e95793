// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

/// Result of validating a single diagram's source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagramCheck {
    Ok,
    Error(String),
}

impl DiagramCheck {
    pub fn is_ok(&self) -> bool {
        matches!(self, DiagramCheck::Ok)
    }
}

/// External, pure-function-shaped collaborator: checks one diagram's source
/// text and reports ok or an error description. Real implementations likely
/// shell out to a renderer binary; the engine treats this as an opaque
/// dependency.
#[async_trait]
pub trait DiagramValidator: Send + Sync {
    async fn validate(&self, source: &str) -> DiagramCheck;
}

/// External collaborator that turns a markdown file into an HTML document,
/// returning the rendered path. Treated as a pure function of the markdown
/// file's contents.
#[async_trait]
pub trait MarkdownRenderer: Send + Sync {
    async fn render(&self, markdown_path: &Path) -> anyhow::Result<PathBuf>;
}

/// A [`DiagramValidator`] whose verdicts are scripted by the test, keyed by
/// an exact match on diagram source.
#[derive(Default)]
pub struct FakeDiagramValidator {
    verdicts: Mutex<HashMap<String, DiagramCheck>>,
    default_verdict: DiagramCheck,
}

impl FakeDiagramValidator {
    pub fn new() -> Self {
        Self {
            verdicts: Mutex::new(HashMap::new()),
            default_verdict: DiagramCheck::Ok,
        }
    }

    pub fn script(&self, source: impl Into<String>, verdict: DiagramCheck) {
        self.verdicts.lock().unwrap().insert(source.into(), verdict);
    }
}

#[async_trait]
impl DiagramValidator for FakeDiagramValidator {
    async fn validate(&self, source: &str) -> DiagramCheck {
        self.verdicts
            .lock()
            .unwrap()
            .get(source)
            .cloned()
            .unwrap_or_else(|| self.default_verdict.clone())
    }
}

/// A [`MarkdownRenderer`] that deterministically maps `<name>.md` to
/// `<name>.html` without touching the filesystem, for tests that don't
/// exercise the real render pipeline.
pub struct FakeMarkdownRenderer {
    pub html_suffix: &'static str,
}

impl Default for FakeMarkdownRenderer {
    fn default() -> Self {
        Self { html_suffix: "html" }
    }
}

#[async_trait]
impl MarkdownRenderer for FakeMarkdownRenderer {
    async fn render(&self, markdown_path: &Path) -> anyhow::Result<PathBuf> {
        Ok(markdown_path.with_extension(self.html_suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_validator_defaults_to_ok() {
        let v = FakeDiagramValidator::new();
        assert_eq!(v.validate("graph TD; A-->B").await, DiagramCheck::Ok);
    }

    #[tokio::test]
    async fn fake_validator_returns_scripted_error() {
        let v = FakeDiagramValidator::new();
        v.script("broken", DiagramCheck::Error("parse error".into()));
        assert_eq!(
            v.validate("broken").await,
            DiagramCheck::Error("parse error".into())
        );
    }

    #[tokio::test]
    async fn fake_renderer_swaps_extension() {
        let r = FakeMarkdownRenderer::default();
        let html = r.render(Path::new("/tmp/p/doc.md")).await.unwrap();
        assert_eq!(html, PathBuf::from("/tmp/p/doc.html"));
    }
}
