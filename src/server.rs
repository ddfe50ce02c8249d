use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tracing::info;

use crate::cli::ServeArgs;
use crate::config::Config;
use crate::conntest::ConnectionTester;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::lifecycle::{ContextRequest, CreateSessionRequest, Engine, ReportRequest};
use crate::model::{ClientKind, OpinionAction, ProgressStatus, RespondAction, Severity};
use crate::prompts::PromptEngine;
use crate::repo::RepoReader;
use crate::store::SessionStore;

/// Shared state for every handler.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub tester: Arc<ConnectionTester>,
    pub prompts: PromptEngine,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        match &self {
            Error::State { phase, .. } => {
                body["phase"] = json!(phase);
            }
            Error::Unresolved(ids) => {
                body["unresolved_issues"] = json!(ids);
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

fn agent_key(headers: &HeaderMap) -> Result<String> {
    headers
        .get("x-agent-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::Auth("missing X-Agent-Key".to_string()))
}

/// Normalize an action string into the closed variant set at the edge.
fn parse_action(raw: &str) -> Result<OpinionAction> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|_| Error::Validation(format!("unknown action: {raw}")))
}

fn parse_severity(raw: &str) -> Result<Severity> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|_| Error::Validation(format!("unknown severity: {raw}")))
}

// ---------------------------------------------------------------------------
// Session routes
// ---------------------------------------------------------------------------

async fn list_sessions(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let sessions = state.engine.store.list_sessions()?;
    let rows: Vec<Value> = sessions
        .iter()
        .map(|s| {
            json!({
                "session_id": s.id,
                "repo_path": s.repo_path,
                "base": s.base,
                "head": s.head,
                "phase": s.phase,
                "turn": s.turn,
                "created_at": s.created_at,
                "updated_at": s.updated_at,
                "agents": s.agents.iter().map(|a| &a.model_id).collect::<Vec<_>>(),
            })
        })
        .collect();
    Ok(Json(json!({ "sessions": rows })))
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<Value>> {
    let sid = state.engine.create_session(req).await?;
    Ok(Json(json!({ "session_id": sid })))
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Result<Json<Value>> {
    state.engine.start(&sid).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn activate_session(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Result<Json<Value>> {
    let sid = state.engine.resolve_sid(&sid)?;
    state.engine.activate(&sid)?;
    Ok(Json(json!({ "ok": true, "session_id": sid })))
}

#[derive(Debug, Deserialize)]
struct FinishQuery {
    #[serde(default)]
    force: Option<String>,
}

async fn finish_session(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Query(query): Query<FinishQuery>,
) -> Result<Json<Value>> {
    let force = matches!(query.force.as_deref(), Some("" | "1" | "true"));
    state.engine.finish(&sid, force).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn process_session(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Result<Json<Value>> {
    state.engine.process_turn(&sid).await?;
    let rollup = state.engine.status_rollup(&sid)?;
    Ok(Json(json!({ "ok": true, "phase": rollup.phase, "turn": rollup.turn })))
}

#[derive(Debug, Deserialize)]
struct FixCompleteBody {
    commit: String,
    #[serde(default)]
    issue_ids: Vec<String>,
}

async fn fix_complete(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(body): Json<FixCompleteBody>,
) -> Result<Json<Value>> {
    state
        .engine
        .fix_complete(&sid, &body.commit, &body.issue_ids)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Result<Json<Value>> {
    state.engine.delete_session(&sid).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn session_status(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Result<Json<Value>> {
    let rollup = state.engine.status_rollup(&sid)?;
    Ok(Json(serde_json::to_value(rollup).map_err(|e| Error::Api(e.to_string()))?))
}

async fn session_issues(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Result<Json<Value>> {
    let issues = state.engine.issues_snapshot(&sid)?;
    Ok(Json(json!({ "issues": issues })))
}

async fn session_diff(
    State(state): State<Arc<AppState>>,
    Path((sid, path)): Path<(String, String)>,
) -> Result<String> {
    state.engine.diff(&sid, &path)
}

#[derive(Debug, Deserialize)]
struct DeltaQuery {
    #[serde(default)]
    path: Option<String>,
}

/// Delta diff between the previous head and the latest fix commit, for
/// raisers verifying a fix.
async fn session_delta(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Query(query): Query<DeltaQuery>,
) -> Result<String> {
    let paths: Vec<String> = query.path.into_iter().collect();
    state.engine.verification_delta(&sid, &paths)
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    start: u32,
    end: u32,
}

async fn session_file_range(
    State(state): State<Arc<AppState>>,
    Path((sid, path)): Path<(String, String)>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<Value>> {
    let lines = state.engine.read_lines(&sid, &path, range.start, range.end)?;
    Ok(Json(json!({ "path": path, "lines": lines })))
}

async fn session_stream(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Result<Sse<impl tokio_stream::Stream<Item = std::result::Result<SseEvent, std::convert::Infallible>>>>
{
    let sid = state.engine.resolve_sid(&sid)?;
    if !state.engine.store.session_exists(&sid) {
        return Err(Error::NotFound(format!("session {sid}")));
    }
    let rx = state.engine.bus.subscribe(&sid);
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(event) => {
            let data = serde_json::to_string(&event).ok()?;
            Some(Ok(SseEvent::default().event(event.kind_str()).data(data)))
        }
        // A lagged subscriber lost activity events; it catches up from the
        // next event and refetches snapshots out of band.
        Err(_) => None,
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn runner_runtime(
    State(state): State<Arc<AppState>>,
    Path((sid, model_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let runtime = state.engine.runner_runtime(&sid, &model_id)?;
    match runtime {
        Some(runtime) => {
            let activity: Vec<Value> = runtime
                .activity_snapshot()
                .iter()
                .map(|a| json!({ "description": a.description, "timestamp": a.timestamp }))
                .collect();
            Ok(Json(json!({
                "model_id": model_id,
                "running": true,
                "stdout": runtime.tails.stdout_snapshot(),
                "stderr": runtime.tails.stderr_snapshot(),
                "activity": activity,
            })))
        }
        None => Ok(Json(json!({ "model_id": model_id, "running": false }))),
    }
}

async fn set_context(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    Json(ctx): Json<ContextRequest>,
) -> Result<Json<Value>> {
    state.engine.set_context(&sid, ctx).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn assist_token(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
) -> Result<Json<Value>> {
    let token = state.engine.assist_token(&sid).await?;
    Ok(Json(json!({ "token": token })))
}

// ---------------------------------------------------------------------------
// Reviewer submission routes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ReportBody {
    model_id: String,
    #[serde(flatten)]
    report: ReportRequest,
}

async fn report_issue(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ReportBody>,
) -> Result<Json<Value>> {
    let key = agent_key(&headers)?;
    let issue = state
        .engine
        .report_issue(&sid, &body.model_id, &key, body.report)
        .await?;
    Ok(Json(json!({ "issue_id": issue.id })))
}

#[derive(Debug, Deserialize)]
struct SummaryBody {
    model_id: String,
    text: String,
}

async fn submit_summary(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SummaryBody>,
) -> Result<Json<Value>> {
    let key = agent_key(&headers)?;
    state
        .engine
        .submit_summary(&sid, &body.model_id, &key, &body.text)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Issue routes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OpinionBody {
    model_id: String,
    action: String,
    reasoning: String,
    #[serde(default)]
    suggested_severity: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    /// Accepted for interop; mentions do not alter consensus.
    #[serde(default)]
    #[allow(dead_code)]
    mentions: Option<Vec<String>>,
}

async fn submit_opinion(
    State(state): State<Arc<AppState>>,
    Path(iid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<OpinionBody>,
) -> Result<Json<Value>> {
    let key = agent_key(&headers)?;
    let action = parse_action(&body.action)?;
    let severity = body
        .suggested_severity
        .as_deref()
        .map(parse_severity)
        .transpose()?;
    let issue = state
        .engine
        .submit_opinion(
            &iid,
            &body.model_id,
            &key,
            action,
            &body.reasoning,
            severity,
            body.confidence,
        )
        .await?;
    Ok(Json(json!({
        "ok": true,
        "consensus": issue.consensus,
        "consensus_type": issue.consensus_type,
    })))
}

#[derive(Debug, Deserialize)]
struct RespondBody {
    model_id: String,
    action: RespondAction,
    reasoning: String,
}

async fn respond_issue(
    State(state): State<Arc<AppState>>,
    Path(iid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RespondBody>,
) -> Result<Json<Value>> {
    let key = agent_key(&headers)?;
    state
        .engine
        .respond(&iid, &body.model_id, &key, body.action, &body.reasoning)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    model_id: String,
    status: ProgressStatus,
    reasoning: String,
}

async fn issue_status(
    State(state): State<Arc<AppState>>,
    Path(iid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StatusBody>,
) -> Result<Json<Value>> {
    let key = agent_key(&headers)?;
    state
        .engine
        .set_issue_status(&iid, &body.model_id, &key, body.status, &body.reasoning)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct DismissBody {
    reasoning: String,
}

async fn dismiss_issue(
    State(state): State<Arc<AppState>>,
    Path(iid): Path<String>,
    Json(body): Json<DismissBody>,
) -> Result<Json<Value>> {
    state.engine.dismiss_issue(&iid, &body.reasoning).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct AssistBody {
    message: String,
}

async fn assist_message(
    State(state): State<Arc<AppState>>,
    Path(iid): Path<String>,
    Json(body): Json<AssistBody>,
) -> Result<Json<Value>> {
    let (messages, cli_command) = state.engine.assist_message(&iid, &body.message).await?;
    Ok(Json(json!({ "messages": messages, "cli_command": cli_command })))
}

#[derive(Debug, Deserialize)]
struct AssistOpinionBody {
    action: String,
    reasoning: String,
    #[serde(default)]
    suggested_severity: Option<String>,
}

async fn assist_opinion(
    State(state): State<Arc<AppState>>,
    Path(iid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AssistOpinionBody>,
) -> Result<Json<Value>> {
    let key = agent_key(&headers)?;
    let action = parse_action(&body.action)?;
    let severity = body
        .suggested_severity
        .as_deref()
        .map(parse_severity)
        .transpose()?;
    let issue = state
        .engine
        .assist_opinion(&iid, &key, action, &body.reasoning, severity)
        .await?;
    Ok(Json(json!({ "ok": true, "consensus_type": issue.consensus_type })))
}

// ---------------------------------------------------------------------------
// Presets, repo, connection test
// ---------------------------------------------------------------------------

async fn list_presets(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let presets = state.engine.store.load_presets()?;
    Ok(Json(json!({ "presets": presets })))
}

#[derive(Debug, Deserialize)]
struct RepoQuery {
    path: String,
}

async fn repo_branches(Query(query): Query<RepoQuery>) -> Result<Json<Value>> {
    let info = RepoReader::validate(&query.path)?;
    let branches = RepoReader::branches(std::path::Path::new(&info.root))?;
    Ok(Json(json!({ "branches": branches })))
}

#[derive(Debug, Deserialize)]
struct ValidateBody {
    path: String,
}

async fn repo_validate(Json(body): Json<ValidateBody>) -> Result<Json<Value>> {
    let info = RepoReader::validate(&body.path)?;
    Ok(Json(serde_json::to_value(info).map_err(|e| Error::Api(e.to_string()))?))
}

#[derive(Debug, Deserialize)]
struct ConnectionTestBody {
    client: ClientKind,
    #[serde(default)]
    binary: Option<String>,
}

async fn connection_test(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConnectionTestBody>,
) -> Result<Response> {
    let callback_url = format!(
        "http://localhost:{}/api/agents/connection-test/callback",
        state.engine.config.port
    );
    let rx = state.tester.begin(
        body.client,
        body.binary.or_else(|| state.engine.config.agent_binary.clone()),
        &state.prompts,
        callback_url,
        Duration::from_secs(state.engine.config.conntest_timeout_secs),
        Duration::from_millis(state.engine.config.stop_grace_ms),
    )?;

    let stream = ReceiverStream::new(rx).map(|event| {
        let mut line = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(line))
    });
    let body = axum::body::Body::from_stream(stream);
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        body,
    )
        .into_response())
}

async fn connection_test_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let key = agent_key(&headers)?;
    if state.tester.callback(&key) {
        Ok(Json(json!({ "ok": true })))
    } else {
        Err(Error::Auth("unknown or spent connection-test token".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Router / entry
// ---------------------------------------------------------------------------

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{sid}/start", post(start_session))
        .route("/api/sessions/{sid}/activate", post(activate_session))
        .route("/api/sessions/{sid}/finish", post(finish_session))
        .route("/api/sessions/{sid}/process", post(process_session))
        .route("/api/sessions/{sid}/fix-complete", post(fix_complete))
        .route(
            "/api/sessions/{sid}",
            axum::routing::delete(delete_session),
        )
        .route("/api/sessions/{sid}/status", get(session_status))
        .route("/api/sessions/{sid}/issues", get(session_issues))
        .route("/api/sessions/{sid}/diff/{*path}", get(session_diff))
        .route("/api/sessions/{sid}/delta", get(session_delta))
        .route("/api/sessions/{sid}/files/{*path}", get(session_file_range))
        .route("/api/sessions/{sid}/stream", get(session_stream))
        .route(
            "/api/sessions/{sid}/runtime/{model_id}",
            get(runner_runtime),
        )
        .route(
            "/api/sessions/{sid}/implementation-context",
            post(set_context),
        )
        .route("/api/sessions/{sid}/assist-token", post(assist_token))
        .route("/api/sessions/{sid}/report", post(report_issue))
        .route("/api/sessions/{sid}/summary", post(submit_summary))
        .route("/api/issues/{iid}/opinions", post(submit_opinion))
        .route("/api/issues/{iid}/respond", post(respond_issue))
        .route("/api/issues/{iid}/status", post(issue_status))
        .route("/api/issues/{iid}/dismiss", post(dismiss_issue))
        .route("/api/issues/{iid}/assist", post(assist_message))
        .route("/api/issues/{iid}/assist/opinion", post(assist_opinion))
        .route("/api/presets", get(list_presets))
        .route("/api/repo/branches", get(repo_branches))
        .route("/api/repo/validate", post(repo_validate))
        .route("/api/agents/connection-test", post(connection_test))
        .route(
            "/api/agents/connection-test/callback",
            post(connection_test_callback),
        )
        .with_state(state)
}

/// Run the orchestrator server until interrupted.
pub async fn serve(args: ServeArgs) -> Result<()> {
    let config = Config::load(&args)?;
    let store = SessionStore::new(&config.storage_root);
    let bus = Arc::new(EventBus::new());
    let prompts = PromptEngine::new(config.prompt_dir.clone());
    let port = config.port;
    let engine = Engine::new(config, store, bus);

    // Sessions stranded by a previous process pick up where they can.
    engine.recover()?;

    let state = Arc::new(AppState {
        engine,
        tester: Arc::new(ConnectionTester::new()),
        prompts,
    });
    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Api(format!("failed to bind {addr}: {e}")))?;
    info!(%addr, "arv server listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::Api(format!("server error: {e}")))
}
