// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
//! The public façade: wires the supervisor, event hub, validation loop, cost
//! ledger and session metadata into the `start`/`resume`/`stop`/`stopAll`/
//! `chat`/`abort`/`changeModel`/`getState` operations, and implements
//! [`ServerContext`] so `http.rs` can drive it directly.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cartograph_core::{
    AgentRuntime, ChatMessage, ClientEvent, Clock, CostTracker, DiagramCheck, DiagramValidator,
    MarkdownRenderer, Session, SystemClock, Usage, ValidationStatus,
};
use cartograph_config::Config;
use futures::future::BoxFuture;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::http::{bind_loopback, serve, ServerContext};
use crate::hub::{ClientId, ClientStream, EventHub};
use crate::supervisor::{self, AgentSupervisor, ChatDispatch, Phase};
use crate::validation::{self, AfterComplete, DiagramFailure, ValidationLoop, ValidationState};

/// Produces a fresh [`AgentRuntime`] handle, once per `start`/`resume` and
/// again on every crash-restart. A trait rather than a bare closure so it
/// can be stored behind an `Arc` and shared with the background loop.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> anyhow::Result<Arc<dyn AgentRuntime>>;
}

/// A [`SessionFactory`] backed by an async closure, for production wiring
/// and for tests that want to script successive runtime instances.
pub struct ClosureSessionFactory<F> {
    f: F,
}

impl<F, Fut> ClosureSessionFactory<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Arc<dyn AgentRuntime>>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> SessionFactory for ClosureSessionFactory<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Arc<dyn AgentRuntime>>> + Send,
{
    async fn create(&self) -> anyhow::Result<Arc<dyn AgentRuntime>> {
        (self.f)().await
    }
}

/// Static knobs an [`Engine`] is constructed with, derived from
/// [`cartograph_config::Config`] plus the operator's CLI invocation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cwd: PathBuf,
    pub target_path: PathBuf,
    pub local_dir: String,
    pub depth: String,
    pub model: String,
    pub provider: String,
    pub base_port: u16,
    pub port_probe_span: u16,
    pub max_crash_restarts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub health_silence_timeout: Duration,
    pub health_check_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_validation_attempts: u32,
    pub validation_enabled: bool,
    pub models: Vec<cartograph_config::ModelInfo>,
}

impl EngineConfig {
    pub fn from_config(
        config: &Config,
        cwd: PathBuf,
        target_path: PathBuf,
        depth: String,
        model: String,
        provider: String,
    ) -> Self {
        Self {
            cwd,
            target_path,
            local_dir: config.server.local_dir.clone(),
            depth,
            model,
            provider,
            base_port: config.server.base_port,
            port_probe_span: config.server.port_probe_span,
            max_crash_restarts: config.supervisor.max_crash_restarts,
            backoff_base: Duration::from_millis(config.supervisor.backoff_base_ms),
            backoff_max: Duration::from_millis(config.supervisor.backoff_max_ms),
            health_silence_timeout: Duration::from_millis(config.supervisor.health_silence_timeout_ms),
            health_check_interval: Duration::from_millis(config.supervisor.health_check_interval_ms),
            heartbeat_interval: Duration::from_millis(config.server.heartbeat_interval_ms),
            max_validation_attempts: config.validation.max_attempts,
            validation_enabled: config.validation.enabled,
            models: config.agent.models.clone(),
        }
    }
}

/// Snapshot returned by [`Engine::get_state`] and used to build the `/state`
/// JSON response and the WebSocket `init` frame.
#[derive(Debug, Clone)]
pub struct PublicState {
    pub agent_running: bool,
    pub is_streaming: bool,
    pub html_path: Option<String>,
    pub target_path: String,
    pub prompt: Option<String>,
    pub validating: bool,
    pub last_activity_ts: Option<chrono::DateTime<chrono::Utc>>,
    pub model: String,
    pub provider: String,
    pub is_subscription: bool,
    pub depth: String,
    pub usage: Usage,
    pub client_count: usize,
    pub event_history_length: usize,
    pub total_cost: f64,
}

/// What `start`/`resume` hand back to the CLI once the agent has announced
/// its first `agent_start` (the readiness gate, §2).
pub struct StartedSession {
    pub session_id: String,
    pub url: String,
    pub token: String,
}

struct EngineState {
    supervisor: AgentSupervisor,
    validation: ValidationLoop,
    cost: CostTracker,
    session: Session,
    document_title: Option<String>,
    document_body: Option<String>,
    last_activity_ts: Option<chrono::DateTime<chrono::Utc>>,
}

/// Ties every collaborator together behind one logical lock (§5): the
/// `Mutex<EngineState>` is held only for plain data mutation, never across
/// an `.await`, so a slow renderer or validator never stalls the supervisor.
pub struct Engine {
    config: EngineConfig,
    secret: String,
    state: Mutex<EngineState>,
    hub: Arc<EventHub>,
    clock: Arc<dyn Clock>,
    factory: Arc<dyn SessionFactory>,
    validator: Arc<dyn DiagramValidator>,
    renderer: Arc<dyn MarkdownRenderer>,
    runtime: Mutex<Option<Arc<dyn AgentRuntime>>>,
    ready_tx: Mutex<Option<tokio::sync::oneshot::Sender<Result<(), String>>>>,
    /// Lets `chat()` and `start()`'s initial prompt report a runtime failure
    /// to the same crash-classification path `run_supervisor_loop` uses for
    /// events arriving on the agent's own event stream, so there is exactly
    /// one place that decides restart-vs-fail and owns the restart timer.
    crash_tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<String>>>,
    supervisor_task: Mutex<Option<JoinHandle<()>>>,
    http_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        factory: Arc<dyn SessionFactory>,
        validator: Arc<dyn DiagramValidator>,
        renderer: Arc<dyn MarkdownRenderer>,
    ) -> Arc<Self> {
        Self::with_clock(config, factory, validator, renderer, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: EngineConfig,
        factory: Arc<dyn SessionFactory>,
        validator: Arc<dyn DiagramValidator>,
        renderer: Arc<dyn MarkdownRenderer>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let mut secret_bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut secret_bytes);
        let secret = hex::encode(secret_bytes);

        let session = Session {
            id: Session::new_id(),
            cwd: config.cwd.clone(),
            target_path: config.target_path.clone(),
            focus: None,
            scope: None,
            depth: config.depth.clone(),
            model: config.model.clone(),
            provider: config.provider.clone(),
            html_path: None,
            port: None,
            secret: secret.clone(),
            timestamp: clock.now_utc(),
        };

        let supervisor = AgentSupervisor::new(
            config.max_crash_restarts,
            config.backoff_base,
            config.backoff_max,
            config.health_silence_timeout,
        );
        let validation = ValidationLoop::new(config.max_validation_attempts);

        Arc::new(Self {
            config,
            secret,
            state: Mutex::new(EngineState {
                supervisor,
                validation,
                cost: CostTracker::new(),
                session,
                document_title: None,
                document_body: None,
                last_activity_ts: None,
            }),
            hub: Arc::new(EventHub::new()),
            clock,
            factory,
            validator,
            renderer,
            runtime: Mutex::new(None),
            ready_tx: Mutex::new(None),
            crash_tx: Mutex::new(None),
            supervisor_task: Mutex::new(None),
            http_task: Mutex::new(None),
        })
    }

    /// Report a runtime failure observed outside the agent's own event
    /// stream (an initial prompt or a chat-time `prompt()` call that
    /// returned an error) through the same crash-classification path used
    /// for `AgentEvent::Error`. A no-op if no session is running.
    fn report_runtime_failure(&self, message: String) {
        if let Some(tx) = self.crash_tx.lock().unwrap().as_ref() {
            let _ = tx.send(message);
        }
    }

    fn pid_path(&self) -> PathBuf {
        self.config.cwd.join(&self.config.local_dir).join(".pid")
    }

    /// Bind the HTTP listener, write the pid file, and spawn the accept loop.
    /// Idempotent: a second call is a no-op while the listener is alive.
    async fn ensure_http_server(self: &Arc<Self>) -> anyhow::Result<u16> {
        {
            let existing = self.state.lock().unwrap().session.port;
            if let Some(port) = existing {
                return Ok(port);
            }
        }

        let (listener, port): (TcpListener, u16) =
            bind_loopback(self.config.base_port, self.config.port_probe_span).await?;
        {
            let mut state = self.state.lock().unwrap();
            state.session.port = Some(port);
        }
        cartograph_core::write_pid_file(&self.config.cwd, &self.config.local_dir, port, self.clock.now_utc())?;

        let ctx: Arc<dyn ServerContext> = self.clone();
        let handle = tokio::spawn(serve(listener, ctx));
        *self.http_task.lock().unwrap() = Some(handle);
        Ok(port)
    }

    /// Start (or resume) a session: bind the server if needed, spawn the
    /// agent and its background event loop, and block until the first
    /// `agent_start` fires — no URL/token is handed to the operator before
    /// that (§2's readiness gate).
    pub async fn start(self: &Arc<Self>, prompt: Option<String>) -> anyhow::Result<StartedSession> {
        let port = self.ensure_http_server().await?;

        {
            let mut state = self.state.lock().unwrap();
            state.supervisor.start();
            state.session.focus = prompt.clone();
        }
        self.hub.reset();

        let runtime = self.factory.create().await?;
        *self.runtime.lock().unwrap() = Some(runtime.clone());

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        *self.ready_tx.lock().unwrap() = Some(ready_tx);

        let (crash_tx, crash_rx) = tokio::sync::mpsc::unbounded_channel();
        *self.crash_tx.lock().unwrap() = Some(crash_tx);

        let engine = self.clone();
        let initial_runtime = runtime.clone();
        let handle = tokio::spawn(async move { engine.run_supervisor_loop(initial_runtime, crash_rx).await });
        *self.supervisor_task.lock().unwrap() = Some(handle);

        if let Some(text) = prompt {
            let full_text = format!("{text}{}", supervisor::FORMATTING_SUFFIX);
            if let Err(e) = runtime.prompt(full_text, false).await {
                self.report_runtime_failure(e.to_string());
            }
        }

        // Block until the agent announces `agent_start`, or until a crash
        // (observed either on the agent's own event stream or reported via
        // `report_runtime_failure` above) moves the supervisor to `failed`
        // before that ever happens — otherwise this would hang forever.
        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(cartograph_core::EngineError::AgentNotReady { reason }.into()),
            Err(_) => {
                return Err(cartograph_core::EngineError::AgentNotReady {
                    reason: "agent runtime stopped before becoming ready".to_string(),
                }
                .into())
            }
        }

        let (session_id, secret) = {
            let state = self.state.lock().unwrap();
            (state.session.id.clone(), state.session.secret.clone())
        };
        self.persist_meta();

        Ok(StartedSession {
            url: format!("http://127.0.0.1:{port}/?token={secret}"),
            token: secret,
            session_id,
        })
    }

    /// Resume a previously persisted session: load its metadata, reuse the
    /// id and saved fields, then run the same startup path as `start` with
    /// no new prompt (the agent resumes its own saved context).
    pub async fn resume(self: &Arc<Self>, id: &str) -> anyhow::Result<StartedSession> {
        let meta = cartograph_core::load(&self.config.target_path, &self.config.local_dir, id).map_err(|_| {
            cartograph_core::EngineError::SessionNotFound {
                id: id.to_string(),
                cwd: self.config.target_path.display().to_string(),
            }
        })?;

        {
            let mut state = self.state.lock().unwrap();
            state.session.id = meta.id.clone();
            state.session.focus = meta.prompt.clone();
            state.session.scope = meta.scope.clone();
            state.session.depth = meta.depth.clone();
            state.session.model = meta.model.clone();
            state.session.html_path = meta.html_path.clone();
        }

        self.start(None).await
    }

    fn persist_meta(&self) {
        let meta = {
            let state = self.state.lock().unwrap();
            state.session.to_meta()
        };
        if let Err(e) = cartograph_core::save(&meta, &self.config.local_dir) {
            warn!(error = %e, "failed to persist session metadata");
        }
    }

    /// Stop the current agent and reset per-session state. The HTTP server
    /// and its listener stay up; clients see `agent_stopped` and can still
    /// reach `/status`/`/state`. Use [`Self::stop_all`] to tear the process
    /// down entirely.
    pub async fn stop(&self) {
        let event = {
            let mut state = self.state.lock().unwrap();
            state.validation.reset();
            state.supervisor.stop()
        };
        self.hub.broadcast(event);

        if let Some(handle) = self.supervisor_task.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            runtime.abort().await;
        }
        self.ready_tx.lock().unwrap().take();
        self.crash_tx.lock().unwrap().take();
    }

    /// Stop the agent and tear down the HTTP listener and pid file — the
    /// operator's `cartograph stop`.
    pub async fn stop_all(&self) {
        self.stop().await;
        if let Some(handle) = self.http_task.lock().unwrap().take() {
            handle.abort();
        }
        std::fs::remove_file(self.pid_path()).ok();
        self.hub.reset();
    }

    /// Deliver a user chat message, steering or starting a new turn per the
    /// current phase (§4.4).
    pub async fn chat(&self, text: String) -> Result<(), cartograph_core::EngineError> {
        let dispatch = self.state.lock().unwrap().supervisor.dispatch_chat();
        let runtime = self.runtime.lock().unwrap().clone();
        let Some(runtime) = runtime else {
            return Err(cartograph_core::EngineError::AgentNotReady {
                reason: "no agent handle".to_string(),
            });
        };

        let full_text = format!("{text}{}", supervisor::FORMATTING_SUFFIX);
        let steer = match dispatch {
            ChatDispatch::Steer => true,
            ChatDispatch::NewTurn => false,
            ChatDispatch::Rejected => {
                return Err(cartograph_core::EngineError::AgentNotReady {
                    reason: "agent is not accepting messages in its current phase".to_string(),
                });
            }
        };

        if let Err(e) = runtime.prompt(full_text, steer).await {
            let reason = e.to_string();
            self.report_runtime_failure(reason.clone());
            return Err(cartograph_core::EngineError::AgentNotReady { reason });
        }
        Ok(())
    }

    /// Abort the current turn without stopping the agent.
    pub async fn abort(&self) {
        let event = self.state.lock().unwrap().supervisor.handle_abort();
        if let Some(event) = event {
            self.hub.broadcast(event);
            if let Some(runtime) = self.runtime.lock().unwrap().clone() {
                runtime.abort().await;
            }
        }
    }

    /// Switch the running agent to a different model/provider.
    pub async fn change_model(&self, model_id: String, provider: String) {
        let runtime = self.runtime.lock().unwrap().clone();
        let Some(runtime) = runtime else {
            self.hub.broadcast(ClientEvent::ModelChangeError {
                error: "agent not ready".to_string(),
            });
            return;
        };

        match runtime.set_model(model_id.clone(), provider.clone()).await {
            Ok(()) => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.session.model = model_id.clone();
                    state.session.provider = provider.clone();
                }
                self.hub.broadcast(ClientEvent::ModelChanged {
                    model: model_id,
                    provider,
                    is_subscription: false,
                });
            }
            Err(e) => self.hub.broadcast(ClientEvent::ModelChangeError { error: e.to_string() }),
        }
    }

    pub fn get_state(&self) -> PublicState {
        let state = self.state.lock().unwrap();
        PublicState {
            agent_running: !matches!(state.supervisor.phase(), Phase::Idle | Phase::Stopped | Phase::Failed),
            is_streaming: state.supervisor.phase() == Phase::Streaming,
            html_path: state.session.html_path.as_ref().map(|p| p.display().to_string()),
            target_path: self.config.target_path.display().to_string(),
            prompt: state.session.focus.clone(),
            validating: state.validation.state() == ValidationState::Validating,
            last_activity_ts: state.last_activity_ts,
            model: state.session.model.clone(),
            provider: state.session.provider.clone(),
            is_subscription: false,
            depth: state.session.depth.clone(),
            usage: state.cost.total_usage(),
            client_count: self.hub.client_count(),
            event_history_length: self.hub.history_len(),
            total_cost: state.cost.total_cost(),
        }
    }

    fn build_init_event(&self) -> ClientEvent {
        let state = self.state.lock().unwrap();
        ClientEvent::Init {
            agent_running: !matches!(state.supervisor.phase(), Phase::Idle | Phase::Stopped | Phase::Failed),
            is_streaming: state.supervisor.phase() == Phase::Streaming,
            html_path: state.session.html_path.as_ref().map(|p| p.display().to_string()),
            target_path: self.config.target_path.display().to_string(),
            prompt: state.session.focus.clone(),
            validating: state.validation.state() == ValidationState::Validating,
            last_activity_ts: state.last_activity_ts,
            model: state.session.model.clone(),
            provider: state.session.provider.clone(),
            is_subscription: false,
            depth: state.session.depth.clone(),
            usage: state.cost.total_usage(),
        }
    }

    fn build_chat_history_event(&self, limit: Option<usize>, is_full_history: bool) -> Option<ClientEvent> {
        let runtime = self.runtime.lock().unwrap().clone()?;
        let messages = runtime.messages();
        if messages.is_empty() {
            return None;
        }
        let history: Vec<ChatMessage> = supervisor::extract_chat_history(&messages, limit);
        if history.is_empty() {
            return None;
        }
        Some(ClientEvent::ChatHistory { messages: history, is_full_history })
    }

    /// One iteration of the per-agent event pump: subscribe, then loop
    /// draining agent events, heartbeat/health timers, and any pending
    /// restart timer, recreating the runtime via the session factory on
    /// every crash-restart until the supervisor gives up or `stop` fires.
    async fn run_supervisor_loop(
        self: Arc<Self>,
        mut runtime: Arc<dyn AgentRuntime>,
        mut crash_rx: tokio::sync::mpsc::UnboundedReceiver<String>,
    ) {
        let mut rx = runtime.subscribe();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut health = tokio::time::interval(self.config.health_check_interval);
        let mut pending_restart: Option<Pin<Box<tokio::time::Sleep>>> = None;

        loop {
            if self.state.lock().unwrap().supervisor.is_intentional_stop() {
                break;
            }

            let sleep_fut = async {
                match pending_restart.as_mut() {
                    Some(sleep) => sleep.await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Ok(event) => {
                            if let Some(delay) = self.handle_agent_event(event).await {
                                pending_restart = Some(Box::pin(tokio::time::sleep(delay)));
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                Some(message) = crash_rx.recv() => {
                    if let Some(delay) = self.handle_reported_failure(message) {
                        pending_restart = Some(Box::pin(tokio::time::sleep(delay)));
                    }
                }
                _ = heartbeat.tick() => self.emit_heartbeat(),
                _ = health.tick() => self.run_health_tick(),
                _ = sleep_fut, if pending_restart.is_some() => {
                    pending_restart = None;
                    match self.factory.create().await {
                        Ok(new_runtime) => {
                            runtime = new_runtime;
                            *self.runtime.lock().unwrap() = Some(runtime.clone());
                            rx = runtime.subscribe();
                        }
                        Err(e) => {
                            let crash = self.state.lock().unwrap().supervisor.handle_crash(e.to_string());
                            for ev in crash.client_events {
                                self.hub.broadcast(ev);
                            }
                            if crash.became_failed {
                                self.fail_pending_readiness(e.to_string());
                            }
                            match crash.restart_delay {
                                Some(delay) => pending_restart = Some(Box::pin(tokio::time::sleep(delay))),
                                None => break,
                            }
                        }
                    }
                }
            }
        }
    }

    /// Classify and broadcast a runtime failure reported out-of-band (via
    /// [`Self::report_runtime_failure`]) through the exact same
    /// crash-handling path as an `AgentEvent::Error` observed on the agent's
    /// own stream, so `start()`'s prompt-time errors and `chat()`'s
    /// mid-session errors are never silently dropped (§4.3).
    fn handle_reported_failure(&self, message: String) -> Option<Duration> {
        let crash = self.state.lock().unwrap().supervisor.handle_crash(message.clone());
        for ev in crash.client_events {
            self.hub.broadcast(ev);
        }
        if crash.became_failed {
            self.fail_pending_readiness(message);
        }
        crash.restart_delay
    }

    /// Fail a `start()` call still waiting on the readiness gate, if one
    /// exists. A no-op once readiness has already fired or `stop()` cleared
    /// the pending sender.
    fn fail_pending_readiness(&self, message: String) {
        if let Some(tx) = self.ready_tx.lock().unwrap().take() {
            let _ = tx.send(Err(message));
        }
    }

    async fn handle_agent_event(self: &Arc<Self>, event: cartograph_core::AgentEvent) -> Option<Duration> {
        let now = self.clock.now();
        let outcome = self.state.lock().unwrap().supervisor.on_agent_event(event, now);

        for ev in outcome.client_events {
            self.hub.broadcast(ev);
        }

        if outcome.ready_fired {
            if let Some(tx) = self.ready_tx.lock().unwrap().take() {
                let _ = tx.send(Ok(()));
            }
        }

        if let Some(message) = outcome.terminally_failed {
            self.fail_pending_readiness(message);
        }

        if let Some(usage) = outcome.usage {
            let model = self.state.lock().unwrap().session.model.clone();
            let cost = estimate_cost(&usage, &model);
            let now_utc = self.clock.now_utc();
            let (latest, session_usage, provider) = {
                let mut state = self.state.lock().unwrap();
                state.last_activity_ts = Some(now_utc);
                state.cost.record(usage, cost, model.clone(), now_utc);
                (state.cost.latest_snapshot(), state.cost.total_usage(), state.session.provider.clone())
            };
            if let Some(latest) = latest {
                self.hub.broadcast(ClientEvent::CostUpdate {
                    latest,
                    session: session_usage,
                    model,
                    provider,
                    is_subscription: false,
                });
            }
        }

        if self.config.validation_enabled {
            if let Some(path) = outcome.doc_write_detected {
                let engine = self.clone();
                tokio::spawn(async move { engine.on_doc_write(path).await });
            }
        }

        outcome.restart_delay
    }

    async fn on_doc_write(self: Arc<Self>, markdown_path: PathBuf) {
        let html_path = match self.renderer.render(&markdown_path).await {
            Ok(path) => path,
            Err(e) => {
                self.hub.broadcast(ClientEvent::RenderError { error: e.to_string() });
                return;
            }
        };

        let fragment = match tokio::fs::read_to_string(&html_path).await {
            Ok(contents) => contents,
            Err(e) => {
                self.hub.broadcast(ClientEvent::RenderError { error: e.to_string() });
                return;
            }
        };
        let title = derive_title(&fragment);

        {
            let mut state = self.state.lock().unwrap();
            state.session.html_path = Some(html_path.clone());
            state.document_title = Some(title);
            state.document_body = Some(fragment);
        }
        self.persist_meta();
        self.hub.broadcast(ClientEvent::DocReady { path: html_path.display().to_string() });

        let start_path = self.state.lock().unwrap().validation.on_doc_ready(html_path.clone());
        if let Some(path) = start_path {
            self.run_validation_pass(markdown_path, path).await;
        }
    }

    fn run_validation_pass(self: &Arc<Self>, markdown_path: PathBuf, html_path: PathBuf) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.state.lock().unwrap().supervisor.is_intentional_stop() {
                return;
            }

            let html = match tokio::fs::read_to_string(&html_path).await {
                Ok(contents) => contents,
                Err(e) => {
                    self.hub.broadcast(ClientEvent::RenderError { error: e.to_string() });
                    return;
                }
            };

            let diagrams = validation::extract_diagrams(&html);
            let total = diagrams.len();
            self.hub.broadcast(ClientEvent::ValidationStart { total });

            let mut failures: Vec<DiagramFailure> = Vec::new();
            for (index, source) in diagrams.iter().enumerate() {
                let check = self.validator.validate(source).await;
                let (status, error) = match &check {
                    DiagramCheck::Ok => (ValidationStatus::Ok, None),
                    DiagramCheck::Error(message) => (ValidationStatus::Error, Some(message.clone())),
                };
                self.hub.broadcast(ClientEvent::ValidationBlock { index, total, status, error });
                if let DiagramCheck::Error(error) = check {
                    failures.push(DiagramFailure {
                        index,
                        error,
                        excerpt: source.chars().take(300).collect(),
                    });
                }
            }

            let ok = failures.is_empty();
            self.hub.broadcast(ClientEvent::ValidationEnd { ok, error_count: failures.len(), total });

            if self.state.lock().unwrap().supervisor.is_intentional_stop() {
                return;
            }

            let after = self.state.lock().unwrap().validation.complete(ok);

            if ok {
                self.hub.broadcast(ClientEvent::DocValidated { path: html_path.display().to_string() });
            } else {
                let (attempt, gave_up) = {
                    let state = self.state.lock().unwrap();
                    (state.validation.attempt(), state.validation.state() == ValidationState::GaveUp)
                };
                if gave_up {
                    self.hub.broadcast(ClientEvent::ValidationGaveUp { attempt });
                } else {
                    self.hub.broadcast(ClientEvent::ValidationFixRequest {
                        attempt,
                        max_attempts: self.config.max_validation_attempts,
                    });
                    let prompt = validation::synthesize_fix_prompt(&markdown_path.display().to_string(), &failures);
                    if let Some(runtime) = self.runtime.lock().unwrap().clone() {
                        if let Err(e) = runtime.prompt(prompt, false).await {
                            self.report_runtime_failure(e.to_string());
                        }
                    }
                }
            }

            if let AfterComplete::RunAgain(next_html) = after {
                self.run_validation_pass(markdown_path, next_html).await;
            }
        })
    }

    fn emit_heartbeat(&self) {
        if self.hub.client_count() == 0 {
            return;
        }
        let ts = self.clock.now_utc();
        let state = self.state.lock().unwrap();
        self.hub.broadcast(ClientEvent::Heartbeat {
            agent_running: !matches!(state.supervisor.phase(), Phase::Idle | Phase::Stopped | Phase::Failed),
            is_streaming: state.supervisor.phase() == Phase::Streaming,
            html_path: state.session.html_path.as_ref().map(|p| p.display().to_string()),
            validating: state.validation.state() == ValidationState::Validating,
            last_activity_ts: state.last_activity_ts,
            healthy: state.supervisor.is_healthy(),
            consecutive_health_failures: state.supervisor.consecutive_health_failures(),
            ts,
            usage: state.cost.total_usage(),
            model: state.session.model.clone(),
            provider: state.session.provider.clone(),
            is_subscription: false,
        });
    }

    fn run_health_tick(&self) {
        let now = self.clock.now();
        let event = self.state.lock().unwrap().supervisor.health_tick(now);
        if let Some(event) = event {
            self.hub.broadcast(event);
        }
    }
}

/// Flat placeholder pricing until a real per-model rate table exists; see
/// DESIGN.md.
fn estimate_cost(usage: &Usage, _model: &str) -> f64 {
    const INPUT_RATE: f64 = 0.000_003;
    const OUTPUT_RATE: f64 = 0.000_015;
    (usage.input as f64) * INPUT_RATE + (usage.output as f64) * OUTPUT_RATE
}

fn derive_title(fragment: &str) -> String {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"(?s)<h1[^>]*>(.*?)</h1>").expect("valid regex"));
    re.captures(fragment)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Exploration".to_string())
}

fn usage_as_json(usage: Usage) -> serde_json::Value {
    serde_json::json!({
        "input": usage.input,
        "output": usage.output,
        "cacheRead": usage.cache_read,
        "cacheWrite": usage.cache_write,
    })
}

#[async_trait]
impl ServerContext for Engine {
    fn secret(&self) -> &str {
        &self.secret
    }

    fn status_json(&self) -> serde_json::Value {
        let state = self.get_state();
        serde_json::json!({
            "agentRunning": state.agent_running,
            "isStreaming": state.is_streaming,
            "clientCount": state.client_count,
            "model": state.model,
            "provider": state.provider,
            "totalCost": state.total_cost,
            "usage": usage_as_json(state.usage),
        })
    }

    fn state_json(&self) -> serde_json::Value {
        let state = self.get_state();
        serde_json::json!({
            "agentRunning": state.agent_running,
            "isStreaming": state.is_streaming,
            "htmlPath": state.html_path,
            "targetPath": state.target_path,
            "prompt": state.prompt,
            "validating": state.validating,
            "lastActivityTs": state.last_activity_ts,
            "model": state.model,
            "provider": state.provider,
            "isSubscription": state.is_subscription,
            "depth": state.depth,
            "usage": usage_as_json(state.usage),
            "eventHistoryLength": state.event_history_length,
            "totalCost": state.total_cost,
        })
    }

    fn models_json(&self) -> serde_json::Value {
        let (current_model, current_provider) = {
            let state = self.state.lock().unwrap();
            (state.session.model.clone(), state.session.provider.clone())
        };
        let models: Vec<serde_json::Value> = self
            .config
            .models
            .iter()
            .map(|m| {
                serde_json::json!({
                    "id": m.id,
                    "provider": m.provider,
                    "active": m.id == current_model && m.provider == current_provider,
                })
            })
            .collect();
        serde_json::json!({
            "current": {
                "model": current_model,
                "provider": current_provider,
            },
            "models": models,
        })
    }

    fn document_fragment(&self) -> Option<(String, String)> {
        let state = self.state.lock().unwrap();
        match (&state.document_title, &state.document_body) {
            (Some(title), Some(body)) => Some((title.clone(), body.clone())),
            _ => None,
        }
    }

    fn connect_client(&self) -> (ClientId, ClientStream) {
        let init = self.build_init_event();
        let (id, stream) = self.hub.connect(init);
        if let Some(history) = self.build_chat_history_event(Some(supervisor::RECENT_CHAT_LIMIT), false) {
            self.hub.send_to(id, history);
        }
        (id, stream)
    }

    fn disconnect_client(&self, id: ClientId) {
        self.hub.disconnect(id);
    }

    async fn handle_client_message(&self, id: ClientId, text: &str) {
        let command = match serde_json::from_str::<cartograph_core::ClientCommand>(text) {
            Ok(command) => command,
            Err(e) => {
                warn!(client = id, error = %e, "dropping unparsable client message");
                return;
            }
        };

        match command {
            cartograph_core::ClientCommand::Prompt { text } => {
                if let Err(e) = self.chat(text).await {
                    warn!(client = id, error = %e, "rejected chat message");
                }
            }
            cartograph_core::ClientCommand::Abort => self.abort().await,
            cartograph_core::ClientCommand::Stop => self.stop().await,
            cartograph_core::ClientCommand::ChangeModel { model_id, provider } => {
                self.change_model(model_id, provider).await;
            }
            cartograph_core::ClientCommand::LoadHistory => {
                if let Some(history) = self.build_chat_history_event(None, true) {
                    self.hub.send_to(id, history);
                } else {
                    info!(client = id, "load_history requested with no message log available");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use cartograph_core::{FakeAgentRuntime, FakeDiagramValidator, FakeMarkdownRenderer};

    use super::*;

    fn test_config(dir: &Path) -> EngineConfig {
        EngineConfig {
            cwd: dir.to_path_buf(),
            target_path: dir.to_path_buf(),
            local_dir: ".cartograph".to_string(),
            depth: "medium".to_string(),
            model: "claude-x".to_string(),
            provider: "anthropic".to_string(),
            base_port: 0,
            port_probe_span: 5,
            max_crash_restarts: 2,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(100),
            health_silence_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            max_validation_attempts: 3,
            validation_enabled: true,
            models: vec![cartograph_config::ModelInfo {
                id: "claude-x".to_string(),
                provider: "anthropic".to_string(),
            }],
        }
    }

    fn test_engine(dir: &Path, runtime: Arc<FakeAgentRuntime>) -> Arc<Engine> {
        let config = test_config(dir);
        let runtime_for_factory = runtime.clone();
        let factory = Arc::new(ClosureSessionFactory::new(move || {
            let runtime: Arc<dyn AgentRuntime> = runtime_for_factory.clone();
            async move { Ok(runtime) }
        }));
        Engine::new(
            config,
            factory,
            Arc::new(FakeDiagramValidator::new()),
            Arc::new(FakeMarkdownRenderer::default()),
        )
    }

    #[tokio::test]
    async fn start_blocks_until_readiness_gate_then_reports_url_and_token() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeAgentRuntime::new());
        let engine = test_engine(dir.path(), runtime.clone());

        let runtime_for_emit = runtime.clone();
        tokio::spawn(async move {
            // Give `start` a moment to subscribe before the signal fires.
            tokio::time::sleep(Duration::from_millis(20)).await;
            runtime_for_emit.emit(cartograph_core::AgentEvent::AgentStart);
        });

        let started = engine.start(Some("explore the repo".to_string())).await.unwrap();
        assert!(started.url.contains(&started.token));
        assert!(engine.get_state().agent_running);
        engine.stop_all().await;
    }

    #[tokio::test]
    async fn start_rejects_instead_of_hanging_when_the_agent_fails_before_ready() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeAgentRuntime::new());
        let engine = test_engine(dir.path(), runtime.clone());

        let runtime_for_emit = runtime.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            runtime_for_emit.emit(cartograph_core::AgentEvent::Error(cartograph_core::AgentFailure {
                message: "no api key found".to_string(),
                class: cartograph_core::FailureClass::Auth,
            }));
        });

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            engine.start(Some("explore the repo".to_string())),
        )
        .await
        .expect("start must not hang when the agent fails before announcing readiness");
        assert!(result.is_err());
        engine.stop_all().await;
    }

    #[tokio::test]
    async fn chat_is_rejected_before_the_agent_is_ready() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeAgentRuntime::new());
        let engine = test_engine(dir.path(), runtime);
        let result = engine.chat("hello".to_string()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn change_model_without_a_running_agent_reports_an_error_event() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeAgentRuntime::new());
        let engine = test_engine(dir.path(), runtime);
        let (_, mut rx) = engine.hub.connect(engine.build_init_event());
        rx.recv().await.unwrap(); // init
        engine.change_model("m2".to_string(), "anthropic".to_string()).await;
        assert!(matches!(rx.recv().await.unwrap(), ClientEvent::ModelChangeError { .. }));
    }

    #[test]
    fn derive_title_falls_back_when_no_heading_present() {
        assert_eq!(derive_title("<p>no heading</p>"), "Exploration");
        assert_eq!(derive_title("<h1>Auth Module</h1><p>...</p>"), "Auth Module");
    }

    #[test]
    fn estimate_cost_is_monotonic_in_usage() {
        let small = Usage { input: 10, output: 10, cache_read: 0, cache_write: 0 };
        let large = Usage { input: 100, output: 100, cache_read: 0, cache_write: 0 };
        assert!(estimate_cost(&small, "m") < estimate_cost(&large, "m"));
    }
}
