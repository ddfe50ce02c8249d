mod common;

use std::sync::Arc;

use arv::conntest::ConnectionTester;
use arv::model::Strictness;
use arv::prompts::PromptEngine;
use arv::server::{AppState, router};
use common::*;
use serde_json::{Value, json};
use tempfile::TempDir;

async fn serve_app() -> (TempDir, TempDir, Arc<arv::lifecycle::Engine>, String) {
    let repo = setup_review_repo();
    let storage = TempDir::new().unwrap();
    let binary = fake_agent_binary(storage.path(), "sleep 60");
    let engine = test_engine(storage.path(), Some(binary));

    let state = Arc::new(AppState {
        engine: engine.clone(),
        tester: Arc::new(ConnectionTester::new()),
        prompts: PromptEngine::new(None),
    });
    let app = router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (repo, storage, engine, format!("http://{addr}"))
}

fn get(url: &str) -> (u16, Value) {
    match ureq::get(url).call() {
        Ok(resp) => (resp.status(), resp.into_json().unwrap_or(Value::Null)),
        Err(ureq::Error::Status(code, resp)) => (code, resp.into_json().unwrap_or(Value::Null)),
        Err(e) => panic!("transport error: {e}"),
    }
}

fn post(url: &str, body: Value, key: Option<&str>) -> (u16, Value) {
    let mut req = ureq::post(url);
    if let Some(key) = key {
        req = req.set("X-Agent-Key", key);
    }
    match req.send_json(&body) {
        Ok(resp) => (resp.status(), resp.into_json().unwrap_or(Value::Null)),
        Err(ureq::Error::Status(code, resp)) => (code, resp.into_json().unwrap_or(Value::Null)),
        Err(e) => panic!("transport error: {e}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_flow_over_http() {
    let (repo, _storage, engine, base) = serve_app().await;
    let repo_path = repo.path().to_string_lossy().to_string();

    // Create, activate, inspect.
    let (status, body) = tokio::task::spawn_blocking({
        let base = base.clone();
        move || {
            post(
                &format!("{base}/api/sessions"),
                json!({ "repo_path": repo_path, "base": "main", "head": "feature" }),
                None,
            )
        }
    })
    .await
    .unwrap();
    assert_eq!(status, 200);
    let sid = body["session_id"].as_str().unwrap().to_string();
    assert_eq!(sid.len(), 12);

    // No agents: start is a validation error surfaced as 400.
    let (status, body) = {
        let url = format!("{base}/api/sessions/{sid}/start");
        tokio::task::spawn_blocking(move || post(&url, json!({}), None))
            .await
            .unwrap()
    };
    assert_eq!(status, 400);
    assert_eq!(body["error"], "validation");

    // Status rollup for the idle session.
    let (status, body) = {
        let url = format!("{base}/api/sessions/{sid}/status");
        tokio::task::spawn_blocking(move || get(&url)).await.unwrap()
    };
    assert_eq!(status, 200);
    assert_eq!(body["phase"], "idle");
    assert_eq!(body["counts"]["total"], 0);

    // Unknown session is a 404 with the not_found kind.
    let (status, body) = {
        let url = format!("{base}/api/sessions/ffffffffffff/status");
        tokio::task::spawn_blocking(move || get(&url)).await.unwrap()
    };
    assert_eq!(status, 404);
    assert_eq!(body["error"], "not_found");

    // Finish before review opens: state conflict with the phase attached.
    let (status, body) = {
        let url = format!("{base}/api/sessions/{sid}/finish");
        tokio::task::spawn_blocking(move || post(&url, json!({}), None))
            .await
            .unwrap()
    };
    assert_eq!(status, 409);
    assert_eq!(body["error"], "state");
    assert_eq!(body["phase"], "idle");

    drop(engine);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn report_and_opinion_over_http() {
    let (repo, _storage, engine, base) = serve_app().await;

    let sid = engine
        .create_session(create_request(
            repo.path(),
            vec![
                agent("model-a", Strictness::Strict),
                agent("model-b", Strictness::Balanced),
            ],
        ))
        .await
        .unwrap();
    engine.start(&sid).await.unwrap();
    let tok_a = token_for(&engine, &sid, "model-a");
    let tok_b = token_for(&engine, &sid, "model-b");

    // Report without a key is a 403.
    let report_body = json!({
        "model_id": "model-a",
        "title": "off-by-one in loop",
        "severity": "high",
        "file": "src/loop.rs",
        "line_start": 3,
        "line_end": 5,
        "description": "last element skipped",
    });
    let (status, _) = {
        let url = format!("{base}/api/sessions/{sid}/report");
        let body = report_body.clone();
        tokio::task::spawn_blocking(move || post(&url, body, None))
            .await
            .unwrap()
    };
    assert_eq!(status, 403);

    // With the minted key the report lands and returns the issue id.
    let (status, body) = {
        let url = format!("{base}/api/sessions/{sid}/report");
        let key = tok_a.clone();
        tokio::task::spawn_blocking(move || post(&url, report_body, Some(&key)))
            .await
            .unwrap()
    };
    assert_eq!(status, 200);
    let iid = body["issue_id"].as_str().unwrap().to_string();

    // Summaries over HTTP advance the session into deliberation.
    for (model, key) in [("model-a", tok_a.clone()), ("model-b", tok_b.clone())] {
        let (status, _) = {
            let url = format!("{base}/api/sessions/{sid}/summary");
            let body = json!({ "model_id": model, "text": "done" });
            tokio::task::spawn_blocking(move || post(&url, body, Some(&key)))
                .await
                .unwrap()
        };
        assert_eq!(status, 200);
    }

    // Unknown action strings are rejected at the adapter edge.
    let (status, body) = {
        let url = format!("{base}/api/issues/{iid}/opinions");
        let key = tok_b.clone();
        let body = json!({ "model_id": "model-b", "action": "approve", "reasoning": "x" });
        tokio::task::spawn_blocking(move || post(&url, body, Some(&key)))
            .await
            .unwrap()
    };
    assert_eq!(status, 400);
    assert_eq!(body["error"], "validation");

    // A proper vote reaches consensus and says so.
    let (status, body) = {
        let url = format!("{base}/api/issues/{iid}/opinions");
        let key = tok_b.clone();
        let body = json!({
            "model_id": "model-b",
            "action": "fix_required",
            "reasoning": "confirmed",
            "confidence": 0.8,
        });
        tokio::task::spawn_blocking(move || post(&url, body, Some(&key)))
            .await
            .unwrap()
    };
    assert_eq!(status, 200);
    assert_eq!(body["consensus_type"], "fix_required");

    // Finish now reports the unresolved issue in the 409 body.
    let (status, body) = {
        let url = format!("{base}/api/sessions/{sid}/finish");
        tokio::task::spawn_blocking(move || post(&url, json!({}), None))
            .await
            .unwrap()
    };
    assert_eq!(status, 409);
    assert_eq!(body["error"], "conflict");
    assert_eq!(body["unresolved_issues"][0], iid.as_str());

    // Diff and file reads work through the session routes.
    let (status, diff) = {
        let url = format!("{base}/api/sessions/{sid}/diff/src/loop.rs");
        tokio::task::spawn_blocking(move || {
            let resp = ureq::get(&url).call().unwrap();
            (resp.status(), resp.into_string().unwrap())
        })
        .await
        .unwrap()
    };
    assert_eq!(status, 200);
    assert!(diff.contains("src/loop.rs"));

    let (status, body) = {
        let url = format!("{base}/api/sessions/{sid}/files/src/loop.rs?start=1&end=2");
        tokio::task::spawn_blocking(move || get(&url)).await.unwrap()
    };
    assert_eq!(status, 200);
    assert_eq!(body["lines"][0]["number"], 1);
}
