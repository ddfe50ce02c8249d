#![allow(dead_code)]

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use arv::cli::ServeArgs;
use arv::config::Config;
use arv::events::EventBus;
use arv::lifecycle::{CreateSessionRequest, Engine};
use arv::model::{AgentConfig, AgentStatus, ClientKind, Strictness};
use arv::store::SessionStore;

pub fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} in {} failed: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Create a repo with a `main` branch and a `feature` branch that modifies
/// `src/parse.go` and adds `src/loop.rs`.
pub fn setup_review_repo() -> tempfile::TempDir {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path();
    run_git(path, &["init"]);
    run_git(path, &["config", "user.email", "test@test.com"]);
    run_git(path, &["config", "user.name", "Test"]);

    std::fs::create_dir_all(path.join("src")).unwrap();
    std::fs::write(
        path.join("src/parse.go"),
        "package parse\n\nfunc Parse(s string) int {\n\treturn len(s)\n}\n",
    )
    .unwrap();
    run_git(path, &["add", "."]);
    run_git(path, &["commit", "-m", "init"]);
    run_git(path, &["branch", "-M", "main"]);

    run_git(path, &["checkout", "-b", "feature"]);
    std::fs::write(
        path.join("src/parse.go"),
        "package parse\n\nfunc Parse(s string) int {\n\tif s == \"\" {\n\t\treturn -1\n\t}\n\treturn len(s)\n}\n",
    )
    .unwrap();
    std::fs::write(
        path.join("src/loop.rs"),
        "fn total(xs: &[u32]) -> u32 {\n    let mut sum = 0;\n    for i in 0..xs.len() - 1 {\n        sum += xs[i];\n    }\n    sum\n}\n",
    )
    .unwrap();
    run_git(path, &["add", "."]);
    run_git(path, &["commit", "-m", "feature work"]);
    run_git(path, &["checkout", "main"]);

    dir
}

/// Commit an author fix on top of `feature` without moving the ref itself,
/// so deltas against `feature` stay meaningful. Returns the commit hash.
pub fn add_fix_commit(repo: &Path) -> String {
    run_git(repo, &["checkout", "--detach", "feature"]);
    let marker = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::fs::write(
        repo.join("src/loop.rs"),
        format!("fn total(xs: &[u32]) -> u32 {{\n    xs.iter().sum() // fix {marker}\n}}\n"),
    )
    .unwrap();
    run_git(repo, &["add", "."]);
    run_git(repo, &["commit", "-m", "fix loop bound"]);
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo)
        .output()
        .unwrap();
    run_git(repo, &["checkout", "main"]);
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

/// Executable shell script standing in for a reviewer client binary.
pub fn fake_agent_binary(dir: &Path, script: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-agent");
    std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().to_string()
}

/// Engine over a temp store, with short deadlines and a fake agent binary.
pub fn test_engine(storage: &Path, agent_binary: Option<String>) -> Arc<Engine> {
    let args = ServeArgs {
        port: 3000,
        storage_root: Some(storage.to_string_lossy().to_string()),
        config: "/nonexistent".to_string(),
    };
    let mut config = Config::load(&args).unwrap();
    config.agent_binary = agent_binary;
    config.review_deadline_secs = 120;
    config.stop_grace_ms = 300;
    let store = SessionStore::new(&config.storage_root);
    Engine::new(config, store, Arc::new(EventBus::new()))
}

pub fn agent(model_id: &str, strictness: Strictness) -> AgentConfig {
    AgentConfig {
        model_id: model_id.to_string(),
        client: ClientKind::Claude,
        provider: "anthropic".to_string(),
        strictness,
        system_prompt: String::new(),
        temperature: None,
        focus: vec![],
        color: String::new(),
        enabled: true,
        status: AgentStatus::Idle,
        reviewing_since: None,
        failure_reason: None,
    }
}

pub fn create_request(repo: &Path, agents: Vec<AgentConfig>) -> CreateSessionRequest {
    CreateSessionRequest {
        repo_path: repo.to_string_lossy().to_string(),
        base: "main".to_string(),
        head: "feature".to_string(),
        preset_ids: vec![],
        agents,
        implementation_context: None,
    }
}

/// Poll until `predicate` holds on the session, or panic after the deadline.
pub async fn wait_for<F>(engine: &Arc<Engine>, sid: &str, predicate: F, what: &str)
where
    F: Fn(&arv::model::Session) -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let session = engine.store.load_session(sid).unwrap();
        if predicate(&session) {
            return;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {what}; phase={} agents={:?}",
            session.phase,
            session
                .agents
                .iter()
                .map(|a| (a.model_id.clone(), a.status))
                .collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub fn token_for(engine: &Arc<Engine>, sid: &str, model_id: &str) -> String {
    engine
        .store
        .load_tokens(sid)
        .unwrap()
        .token_for(model_id)
        .unwrap()
        .to_string()
}
