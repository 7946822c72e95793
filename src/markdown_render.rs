// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
//! A real [`MarkdownRenderer`] built on `pulldown-cmark`.
//!
//! Mirrors the event-walking style used for terminal rendering elsewhere in
//! this codebase, except the target is HTML rather than styled terminal
//! lines, and fenced ```mermaid blocks are special-cased: they're emitted as
//! `<pre class="mermaid">...</pre>` verbatim instead of being syntax-"escaped"
//! as code, because `cartograph-engine`'s validation pass looks for exactly
//! that tag to find diagram source to check.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cartograph_core::MarkdownRenderer;
use pulldown_cmark::{CodeBlockKind, CowStr, Event, Options, Parser, Tag, TagEnd};
use tokio::fs;

/// Renders a markdown document to a sibling `.html` file.
pub struct PulldownMarkdownRenderer;

impl PulldownMarkdownRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PulldownMarkdownRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarkdownRenderer for PulldownMarkdownRenderer {
    async fn render(&self, markdown_path: &Path) -> anyhow::Result<PathBuf> {
        let source = fs::read_to_string(markdown_path).await?;
        let html = render_html(&source);
        let out_path = markdown_path.with_extension("html");
        fs::write(&out_path, html).await?;
        Ok(out_path)
    }
}

fn render_html(markdown: &str) -> String {
    let mut opts = Options::empty();
    opts.insert(Options::ENABLE_TABLES);
    opts.insert(Options::ENABLE_STRIKETHROUGH);
    opts.insert(Options::ENABLE_FOOTNOTES);

    let mut html = String::with_capacity(markdown.len() * 2);
    let mut in_mermaid = false;
    let mut mermaid_buf = String::new();
    let mut passthrough = Vec::new();

    for event in Parser::new_ext(markdown, opts) {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(lang))) if is_mermaid(&lang) => {
                flush_passthrough(&mut html, &mut passthrough);
                in_mermaid = true;
                mermaid_buf.clear();
            }
            Event::End(TagEnd::CodeBlock) if in_mermaid => {
                html.push_str("<pre class=\"mermaid\">");
                html.push_str(&html_escape(&mermaid_buf));
                html.push_str("</pre>\n");
                in_mermaid = false;
            }
            Event::Text(text) if in_mermaid => {
                mermaid_buf.push_str(&text);
            }
            other if in_mermaid => {
                // Any other event inside a mermaid fence (shouldn't normally
                // occur) is dropped rather than passed through, since the
                // block is rendered as raw diagram source, not markup.
                let _ = other;
            }
            other => passthrough.push(other),
        }
    }
    flush_passthrough(&mut html, &mut passthrough);
    html
}

fn flush_passthrough(html: &mut String, events: &mut Vec<Event<'_>>) {
    if events.is_empty() {
        return;
    }
    pulldown_cmark::html::push_html(html, events.drain(..));
}

fn is_mermaid(lang: &CowStr<'_>) -> bool {
    lang.as_ref().trim() == "mermaid"
}

fn html_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mermaid_fence_becomes_pre_mermaid() {
        let md = "# Title\n\n```mermaid\ngraph TD; A-->B;\n```\n";
        let html = render_html(md);
        assert!(html.contains("<pre class=\"mermaid\">"));
        assert!(html.contains("graph TD; A--&gt;B;"));
    }

    #[test]
    fn other_code_fences_render_normally() {
        let md = "```rust\nfn main() {}\n```\n";
        let html = render_html(md);
        assert!(html.contains("language-rust"));
        assert!(!html.contains("class=\"mermaid\""));
    }

    #[test]
    fn plain_text_passes_through() {
        let html = render_html("hello **world**");
        assert!(html.contains("<strong>world</strong>"));
    }
}
