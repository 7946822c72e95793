// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::sync::OnceLock;

use cartograph_core::{DiagramCheck, DiagramValidator};
use regex::Regex;

/// Diagram blocks are rendered as either tag; both are matched, DOTALL so a
/// diagram spanning multiple lines is captured whole.
fn mermaid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<(?:pre|div) class="mermaid">(.*?)</(?:pre|div)>"#).expect("valid regex")
    })
}

/// Scan rendered HTML for mermaid diagram blocks, trimmed, in document order.
pub fn extract_diagrams(html: &str) -> Vec<String> {
    mermaid_re()
        .captures_iter(html)
        .map(|caps| caps[1].trim().to_string())
        .collect()
}

const EXCERPT_LEN: usize = 300;

/// One block that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagramFailure {
    pub index: usize,
    pub error: String,
    pub excerpt: String,
}

fn excerpt(source: &str) -> String {
    source.chars().take(EXCERPT_LEN).collect()
}

/// Validate every extracted diagram in order, returning the failures (if
/// any). At most one validation runs at a time (enforced by the caller via
/// [`ValidationLoop::on_doc_ready`]); this function itself is just the pure
/// per-document sweep.
pub async fn validate_all(diagrams: &[String], validator: &dyn DiagramValidator) -> Vec<DiagramFailure> {
    let mut failures = Vec::new();
    for (i, source) in diagrams.iter().enumerate() {
        if let DiagramCheck::Error(error) = validator.validate(source).await {
            failures.push(DiagramFailure {
                index: i,
                error,
                excerpt: excerpt(source),
            });
        }
    }
    failures
}

const REMEDIATION_HINTS: &[&str] = &[
    "escape HTML entities in node labels",
    "prefer parentheses over square brackets in sequence-diagram messages",
    "avoid backticks inside mermaid source",
    "keep node ids alphanumeric",
];

/// Build the fix prompt sent back to the agent after a failed validation
/// pass, naming the markdown path it should edit.
pub fn synthesize_fix_prompt(markdown_path: &str, failures: &[DiagramFailure]) -> String {
    let mut prompt = format!(
        "The diagrams in {markdown_path} failed validation. Fix the following blocks:\n\n"
    );
    for failure in failures {
        prompt.push_str(&format!(
            "Block {}: {}\nSource excerpt:\n{}\n\n",
            failure.index + 1,
            failure.error,
            failure.excerpt
        ));
    }
    prompt.push_str("When fixing mermaid diagrams:\n");
    for hint in REMEDIATION_HINTS {
        prompt.push_str(&format!("- {hint}\n"));
    }
    prompt.push_str(&format!("Edit {markdown_path} using the same tool you used to write it."));
    prompt
}

/// Lifecycle of the diagram fix-loop, one instance per engine session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    None,
    Validating,
    FixSent,
    Validated,
    GaveUp,
}

/// What the caller should do after reporting a validation result to the
/// loop via [`ValidationLoop::complete`].
#[derive(Debug, Clone, PartialEq)]
pub enum AfterComplete {
    /// Nothing queued; wait for the next `doc_ready`.
    Idle,
    /// Another `doc_ready` arrived while this pass was running; re-run
    /// immediately against the given (latest) HTML path.
    RunAgain(PathBuf),
}

/// Drives the `{none, validating, fix_sent, validated, gave_up}` state
/// machine described in §4.3, including the single-flight + queued-rerun
/// rule (at most one validation in flight at a time).
pub struct ValidationLoop {
    state: ValidationState,
    attempt: u32,
    max_attempts: u32,
    queued_path: Option<PathBuf>,
}

impl ValidationLoop {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: ValidationState::None,
            attempt: 0,
            max_attempts,
            queued_path: None,
        }
    }

    pub fn state(&self) -> ValidationState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Called on every `doc_ready`. Returns `Some(path)` if the caller
    /// should start validating `path` now; `None` if a pass is already in
    /// flight (the path is queued for a re-run after it completes).
    pub fn on_doc_ready(&mut self, html_path: PathBuf) -> Option<PathBuf> {
        if self.state == ValidationState::Validating {
            self.queued_path = Some(html_path);
            None
        } else {
            self.state = ValidationState::Validating;
            Some(html_path)
        }
    }

    /// Report the outcome of the in-flight pass. `ok` means every diagram
    /// validated; resets the attempt counter. A failure advances the
    /// attempt counter and moves to `fix_sent` (if attempts remain) or
    /// `gave_up`.
    pub fn complete(&mut self, ok: bool) -> AfterComplete {
        if ok {
            self.state = ValidationState::Validated;
            self.attempt = 0;
        } else {
            self.attempt += 1;
            self.state = if self.attempt > self.max_attempts {
                ValidationState::GaveUp
            } else {
                ValidationState::FixSent
            };
        }

        match self.queued_path.take() {
            Some(path) => {
                self.state = ValidationState::Validating;
                AfterComplete::RunAgain(path)
            }
            None => AfterComplete::Idle,
        }
    }

    /// A fix prompt was dispatched; the next `doc_ready` for the same
    /// session moves the loop back to `validating`.
    pub fn mark_fix_sent(&mut self) {
        self.state = ValidationState::FixSent;
    }

    /// `stop()` resets the loop to `none`.
    pub fn reset(&mut self) {
        self.state = ValidationState::None;
        self.attempt = 0;
        self.queued_path = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_core::FakeDiagramValidator;

    #[test]
    fn extract_diagrams_finds_pre_and_div_blocks() {
        let html = r#"
            <pre class="mermaid">graph TD; A-->B</pre>
            <p>text</p>
            <div class="mermaid">sequenceDiagram
Alice->>Bob: hi</div>
        "#;
        let blocks = extract_diagrams(html);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], "graph TD; A-->B");
        assert!(blocks[1].starts_with("sequenceDiagram"));
    }

    #[test]
    fn extract_diagrams_empty_when_none_present() {
        assert!(extract_diagrams("<p>no diagrams here</p>").is_empty());
    }

    #[tokio::test]
    async fn validate_all_collects_failures_in_order() {
        let v = FakeDiagramValidator::new();
        v.script("bad", DiagramCheck::Error("parse error".into()));
        let diagrams = vec!["good".to_string(), "bad".to_string()];
        let failures = validate_all(&diagrams, &v).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 1);
        assert_eq!(failures[0].error, "parse error");
    }

    #[test]
    fn zero_diagrams_is_immediate_validated() {
        let mut loop_ = ValidationLoop::new(3);
        loop_.on_doc_ready(PathBuf::from("doc.html"));
        assert_eq!(loop_.complete(true), AfterComplete::Idle);
        assert_eq!(loop_.state(), ValidationState::Validated);
    }

    #[test]
    fn exactly_max_failed_attempts_gives_up_on_the_next_one() {
        let mut loop_ = ValidationLoop::new(3);
        for _ in 0..3 {
            loop_.on_doc_ready(PathBuf::from("doc.html"));
            loop_.complete(false);
        }
        // Exactly `max_attempts` failures still has a fix in flight; only the
        // (max_attempts + 1)-th failure gives up.
        assert_eq!(loop_.state(), ValidationState::FixSent);
        assert_eq!(loop_.attempt(), 3);

        loop_.on_doc_ready(PathBuf::from("doc.html"));
        loop_.complete(false);
        assert_eq!(loop_.state(), ValidationState::GaveUp);
        assert_eq!(loop_.attempt(), 4);
    }

    #[test]
    fn failure_before_max_attempts_moves_to_fix_sent() {
        let mut loop_ = ValidationLoop::new(3);
        loop_.on_doc_ready(PathBuf::from("doc.html"));
        loop_.complete(false);
        assert_eq!(loop_.state(), ValidationState::FixSent);
    }

    #[test]
    fn doc_ready_while_validating_is_queued_not_started() {
        let mut loop_ = ValidationLoop::new(3);
        assert!(loop_.on_doc_ready(PathBuf::from("a.html")).is_some());
        assert!(loop_.on_doc_ready(PathBuf::from("b.html")).is_none());
    }

    #[test]
    fn queued_doc_ready_reruns_immediately_on_complete() {
        let mut loop_ = ValidationLoop::new(3);
        loop_.on_doc_ready(PathBuf::from("a.html"));
        loop_.on_doc_ready(PathBuf::from("b.html"));
        let after = loop_.complete(true);
        assert_eq!(after, AfterComplete::RunAgain(PathBuf::from("b.html")));
        assert_eq!(loop_.state(), ValidationState::Validating);
    }

    #[test]
    fn reset_returns_to_none() {
        let mut loop_ = ValidationLoop::new(3);
        loop_.on_doc_ready(PathBuf::from("a.html"));
        loop_.complete(false);
        loop_.reset();
        assert_eq!(loop_.state(), ValidationState::None);
        assert_eq!(loop_.attempt(), 0);
    }

    #[test]
    fn fix_prompt_names_path_and_includes_excerpt_and_hints() {
        let failures = vec![DiagramFailure {
            index: 0,
            error: "unexpected token".into(),
            excerpt: "graph TD; A->B".into(),
        }];
        let prompt = synthesize_fix_prompt("notes/doc.md", &failures);
        assert!(prompt.contains("notes/doc.md"));
        assert!(prompt.contains("unexpected token"));
        assert!(prompt.contains("graph TD; A->B"));
        assert!(prompt.contains("alphanumeric"));
    }
}
