// Copyright (c) 2026 The Cartograph Authors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cartograph_config::Config;
use cartograph_core::{
    AgentEvent, AgentRuntime, FakeAgentRuntime, FakeDiagramValidator, FakeMarkdownRenderer,
};
use cartograph_engine::{ClosureSessionFactory, Engine, EngineConfig};

fn test_config(dir: &Path) -> EngineConfig {
    let config = Config::default();
    EngineConfig::from_config(
        &config,
        dir.to_path_buf(),
        dir.to_path_buf(),
        "medium".to_string(),
        "claude-x".to_string(),
        "anthropic".to_string(),
    )
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
async fn start_then_stop_all_removes_pid_file() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeAgentRuntime::new());
    let engine = test_engine(dir.path(), runtime.clone());

    let runtime_for_emit = runtime.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        runtime_for_emit.emit(AgentEvent::AgentStart);
    });

    engine.start(Some("map the auth module".to_string())).await.unwrap();
    assert!(engine.get_state().agent_running);

    let pid_path = dir.path().join(".cartograph").join(".pid");
    assert!(pid_path.is_file());

    engine.stop_all().await;
    assert!(!pid_path.is_file());
    assert!(!engine.get_state().agent_running);
}

#[tokio::test]
async fn resume_rejects_an_unknown_session_id() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeAgentRuntime::new());
    let engine = test_engine(dir.path(), runtime);

    let err = engine.resume("deadbeef").await.unwrap_err();
    let engine_err = err.downcast_ref::<cartograph_core::EngineError>();
    assert!(matches!(
        engine_err,
        Some(cartograph_core::EngineError::SessionNotFound { .. })
    ));
}

#[tokio::test]
async fn resume_picks_up_a_persisted_session() {
    let dir = tempfile::tempdir().unwrap();
    let meta = cartograph_core::SessionMeta {
        id: "abcd1234".to_string(),
        target_path: dir.path().to_path_buf(),
        prompt: Some("explore the http layer".to_string()),
        scope: None,
        depth: "deep".to_string(),
        model: "claude-x".to_string(),
        html_path: None,
        session_file: None,
        port: None,
        timestamp: chrono::Utc::now(),
    };
    cartograph_core::save(&meta, ".cartograph").unwrap();

    let runtime = Arc::new(FakeAgentRuntime::new());
    let engine = test_engine(dir.path(), runtime.clone());

    let runtime_for_emit = runtime.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        runtime_for_emit.emit(AgentEvent::AgentStart);
    });

    let started = engine.resume("abcd1234").await.unwrap();
    assert_eq!(started.session_id, "abcd1234");
    assert_eq!(engine.get_state().depth, "deep");
    engine.stop_all().await;
}
