// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

use cartograph_config::Depth;

#[derive(Parser, Debug)]
#[command(
    name = "cartograph",
    about = "Supervises an AI exploration agent and streams its findings to a browser",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (overrides auto-discovery)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a new exploration session.
    Start {
        /// Optional initial prompt describing what to explore.
        #[arg(value_name = "PROMPT")]
        prompt: Option<String>,

        /// How thoroughly to explore the tree.
        #[arg(long, value_enum, default_value = "medium")]
        depth: DepthArg,

        /// Subpath of the tree to focus on. May be repeated.
        #[arg(long = "path", value_name = "DIR")]
        paths: Vec<PathBuf>,

        /// Model to use (auto-selected from config/provider if omitted).
        #[arg(long, short = 'm')]
        model: Option<String>,
    },

    /// Resume a previously started session.
    Resume {
        /// Session id (8 hex chars), or unique prefix. Omit to resume the
        /// most recently active session in the current tree.
        #[arg(value_name = "ID")]
        id: Option<String>,
    },

    /// Stop the running session for the current working directory.
    Stop,

    /// Manage stored provider credentials.
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },

    /// Generate a shell completion script.
    Completion {
        #[arg(value_enum)]
        shell: ShellArg,
    },
}

#[derive(Subcommand, Debug)]
pub enum AuthCommands {
    /// Store an API key for a provider.
    Set {
        /// Provider id, e.g. "anthropic", "openai".
        provider: String,
        /// API key. Read from stdin if omitted.
        key: Option<String>,
    },
    /// Interactive login (prompts for a key and stores it).
    Login {
        provider: String,
    },
    /// Remove the stored key for a provider.
    Logout {
        provider: String,
    },
    /// List providers with a stored key.
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DepthArg {
    Shallow,
    Medium,
    Deep,
}

impl From<DepthArg> for Depth {
    fn from(d: DepthArg) -> Self {
        match d {
            DepthArg::Shallow => Depth::Shallow,
            DepthArg::Medium => Depth::Medium,
            DepthArg::Deep => Depth::Deep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ShellArg {
    Bash,
    Zsh,
    Fish,
}

impl From<ShellArg> for Shell {
    fn from(s: ShellArg) -> Self {
        match s {
            ShellArg::Bash => Shell::Bash,
            ShellArg::Zsh => Shell::Zsh,
            ShellArg::Fish => Shell::Fish,
        }
    }
}

pub fn print_completions(shell: ShellArg) {
    let mut cmd = Cli::command();
    generate(Shell::from(shell), &mut cmd, "cartograph", &mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_with_depth_and_repeated_paths() {
        let cli = Cli::parse_from([
            "cartograph",
            "start",
            "explore the parser",
            "--depth",
            "deep",
            "--path",
            "src/parser",
            "--path",
            "src/lexer",
        ]);

        match cli.command {
            Commands::Start { prompt, depth, paths, model } => {
                assert_eq!(prompt.as_deref(), Some("explore the parser"));
                assert_eq!(depth, DepthArg::Deep);
                assert_eq!(paths.len(), 2);
                assert!(model.is_none());
            }
            other => panic!("expected Start, got {other:?}"),
        }
    }

    #[test]
    fn depth_defaults_to_medium_when_omitted() {
        let cli = Cli::parse_from(["cartograph", "start"]);
        match cli.command {
            Commands::Start { depth, .. } => assert_eq!(depth, DepthArg::Medium),
            other => panic!("expected Start, got {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_subcommand() {
        assert!(Cli::try_parse_from(["cartograph"]).is_err());
    }

    #[test]
    fn auth_set_subcommand_parses() {
        let cli = Cli::parse_from(["cartograph", "auth", "set", "anthropic", "sk-test"]);
        match cli.command {
            Commands::Auth { command: AuthCommands::Set { provider, key } } => {
                assert_eq!(provider, "anthropic");
                assert_eq!(key.as_deref(), Some("sk-test"));
            }
            other => panic!("expected Auth::Set, got {other:?}"),
        }
    }
}
