// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
mod agent_process;
mod auth_store;
mod cli;
mod markdown_render;
mod mermaid_validate;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cartograph_core::EngineError;
use cartograph_engine::{ClosureSessionFactory, Engine, EngineConfig};

use agent_process::SubprocessAgentRuntime;
use cli::{AuthCommands, Cli, Commands};
use markdown_render::PulldownMarkdownRenderer;
use mermaid_validate::MermaidCliValidator;

const AUTH_FAILURE_EXIT: i32 = 2;
const ARGUMENT_ERROR_EXIT: i32 = 3;
const SESSION_NOT_FOUND_EXIT: i32 = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            classify_exit_code(&e)
        }
    };

    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Completion { shell } => {
            cli::print_completions(shell);
            Ok(0)
        }
        Commands::Auth { command } => run_auth(command),
        Commands::Start { prompt, depth, paths, model } => {
            run_start(cli.config, prompt, depth, paths, model).await
        }
        Commands::Resume { id } => run_resume(cli.config, id).await,
        Commands::Stop => run_stop(cli.config).await,
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

fn classify_exit_code(err: &anyhow::Error) -> i32 {
    if let Some(EngineError::SessionNotFound { .. }) = err.downcast_ref::<EngineError>() {
        return SESSION_NOT_FOUND_EXIT;
    }
    if let Some(EngineError::AuthFailure { .. }) = err.downcast_ref::<EngineError>() {
        return AUTH_FAILURE_EXIT;
    }
    1
}

fn target_path(paths: &[PathBuf], cwd: &std::path::Path) -> PathBuf {
    match paths.first() {
        Some(p) if p.is_absolute() => p.clone(),
        Some(p) => cwd.join(p),
        None => cwd.to_path_buf(),
    }
}

async fn build_engine(
    config_path: Option<PathBuf>,
    depth: cartograph_config::Depth,
    target: PathBuf,
    model: Option<String>,
) -> anyhow::Result<Arc<Engine>> {
    let config = cartograph_config::load(config_path.as_deref())?;
    let cwd = std::env::current_dir().context("resolving current working directory")?;

    let model = model.unwrap_or_else(|| config.agent.default_model.clone());
    let provider = config.agent.default_provider.clone();

    let depth_str = match depth {
        cartograph_config::Depth::Shallow => "shallow",
        cartograph_config::Depth::Medium => "medium",
        cartograph_config::Depth::Deep => "deep",
    }
    .to_string();

    let engine_config = EngineConfig::from_config(&config, cwd.clone(), target, depth_str, model, provider);

    let agent_command = config.agent.command.clone();
    let mermaid_command = config.validation.mermaid_command.clone();
    let agent_cwd = engine_config.target_path.clone();

    let mut agent_env = Vec::new();
    if let Some(key) = auth_store::resolve_env(&engine_config.provider)? {
        agent_env.push((
            format!("CARTOGRAPH_{}_API_KEY", engine_config.provider.to_uppercase()),
            key,
        ));
    }

    let factory = Arc::new(ClosureSessionFactory::new(move || {
        let command = agent_command.clone();
        let cwd = agent_cwd.clone();
        let env = agent_env.clone();
        async move {
            let runtime = SubprocessAgentRuntime::spawn(&command, &cwd, &env).await?;
            Ok(Arc::new(runtime) as Arc<dyn cartograph_core::AgentRuntime>)
        }
    }));

    let validator = Arc::new(MermaidCliValidator::new(mermaid_command));
    let renderer = Arc::new(PulldownMarkdownRenderer::new());

    Ok(Engine::new(engine_config, factory, validator, renderer))
}

async fn run_start(
    config_path: Option<PathBuf>,
    prompt: Option<String>,
    depth: cli::DepthArg,
    paths: Vec<PathBuf>,
    model: Option<String>,
) -> anyhow::Result<i32> {
    let cwd = std::env::current_dir().context("resolving current working directory")?;
    let target = target_path(&paths, &cwd);
    let engine = build_engine(config_path, depth.into(), target, model).await?;

    let started = engine.start(prompt).await?;
    println!("session {} started", started.session_id);
    println!("{}", started.url);

    wait_for_interrupt(&engine).await;
    Ok(0)
}

async fn run_resume(config_path: Option<PathBuf>, id: Option<String>) -> anyhow::Result<i32> {
    let cwd = std::env::current_dir().context("resolving current working directory")?;
    let config = cartograph_config::load(config_path.as_deref())?;

    let id = match id {
        Some(id) => id,
        None => most_recent_session_id(&cwd, &config.server.local_dir)
            .ok_or_else(|| EngineError::SessionNotFound {
                id: "<none>".to_string(),
                cwd: cwd.display().to_string(),
            })?,
    };

    let engine = build_engine(
        config_path,
        cartograph_config::Depth::Medium,
        cwd.clone(),
        None,
    )
    .await?;

    let started = engine.resume(&id).await?;
    println!("session {} resumed", started.session_id);
    println!("{}", started.url);

    wait_for_interrupt(&engine).await;
    Ok(0)
}

fn most_recent_session_id(cwd: &std::path::Path, local_dir: &str) -> Option<String> {
    let mut sessions = cartograph_core::load_local_sessions(cwd, local_dir);
    sessions.sort_by_key(|s| s.timestamp);
    sessions.pop().map(|s| s.id)
}

async fn run_stop(config_path: Option<PathBuf>) -> anyhow::Result<i32> {
    let cwd = std::env::current_dir().context("resolving current working directory")?;
    let config = cartograph_config::load(config_path.as_deref())?;
    let stopped = cartograph_core::stop_external(&cwd, &config.server.local_dir)?;
    if stopped {
        println!("stopped");
        Ok(0)
    } else {
        println!("no running session found in {}", cwd.display());
        Ok(SESSION_NOT_FOUND_EXIT)
    }
}

async fn wait_for_interrupt(engine: &Arc<Engine>) {
    let _ = tokio::signal::ctrl_c().await;
    engine.stop_all().await;
}

fn run_auth(command: AuthCommands) -> anyhow::Result<i32> {
    match command {
        AuthCommands::Set { provider, key } => {
            let key = match key {
                Some(k) => k,
                None => read_key_from_stdin()?,
            };
            auth_store::set(&provider, &key)?;
            println!("stored credentials for {provider}");
            Ok(0)
        }
        AuthCommands::Login { provider } => {
            println!("paste the API key for {provider}:");
            let key = read_key_from_stdin()?;
            auth_store::set(&provider, &key)?;
            println!("stored credentials for {provider}");
            Ok(0)
        }
        AuthCommands::Logout { provider } => {
            let removed = auth_store::remove(&provider)?;
            if removed {
                println!("removed credentials for {provider}");
                Ok(0)
            } else {
                println!("no stored credentials for {provider}");
                Ok(ARGUMENT_ERROR_EXIT)
            }
        }
        AuthCommands::List => {
            let providers = auth_store::list()?;
            if providers.is_empty() {
                println!("no stored credentials");
            } else {
                for p in providers {
                    println!("{p}");
                }
            }
            Ok(0)
        }
    }
}

fn read_key_from_stdin() -> anyhow::Result<String> {
    use std::io::BufRead;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let key = line.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("no API key provided");
    }
    Ok(key)
}
