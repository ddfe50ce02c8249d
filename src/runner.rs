use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::events::{EventBus, SessionEvent};
use crate::model::ClientKind;
use crate::process::{self, ExitReason, OutputTails, ProcessConfig};

/// Everything needed to launch one reviewer subprocess.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub session_id: String,
    pub model_id: String,
    pub client: ClientKind,
    pub prompt: String,
    /// Per-session API root handed to the child as `ARV_BASE`.
    pub api_base: String,
    /// Agent access token handed to the child as `ARV_KEY`.
    pub token: String,
    pub working_dir: PathBuf,
    pub deadline: Duration,
    pub grace: Duration,
    /// Override binary for all client kinds (testing hook).
    pub binary_override: Option<String>,
}

/// One reviewer activity entry (file read, search, tool invocation).
#[derive(Debug, Clone)]
pub struct ActivityEvent {
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

/// Live per-runner state surfaced by the `runtime` query: bounded output
/// tails and recent activity.
#[derive(Debug)]
pub struct RunnerRuntime {
    pub tails: Arc<OutputTails>,
    activity_cap: usize,
    activity: Mutex<VecDeque<ActivityEvent>>,
}

impl RunnerRuntime {
    pub fn new(tail_bytes: usize, activity_cap: usize) -> Self {
        Self {
            tails: Arc::new(OutputTails::new(tail_bytes)),
            activity_cap,
            activity: Mutex::new(VecDeque::new()),
        }
    }

    fn record_activity(&self, event: ActivityEvent) {
        let mut activity = self.activity.lock().expect("activity lock poisoned");
        activity.push_back(event);
        while activity.len() > self.activity_cap {
            activity.pop_front();
        }
    }

    pub fn activity_snapshot(&self) -> Vec<ActivityEvent> {
        self.activity
            .lock()
            .expect("activity lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

/// Cancellation handle for an in-flight reviewer.
pub struct RunnerHandle {
    pub model_id: String,
    pub runtime: Arc<RunnerRuntime>,
    cancel: watch::Sender<bool>,
}

impl RunnerHandle {
    /// Ask the subprocess to stop; it exits within the grace period.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Raw result of one reviewer subprocess run. Whether it counts as
/// `submitted` is decided by the lifecycle controller against the store.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub reason: ExitReason,
    pub exit_code: i32,
    pub failure: Option<String>,
}

/// Build the command line for a client kind. Returns (binary, args,
/// stdin payload): some clients take the prompt as an argument, others on
/// stdin.
pub fn build_command(
    client: ClientKind,
    binary_override: Option<&str>,
    prompt: &str,
) -> (String, Vec<String>, Option<String>) {
    let binary = |default: &str| {
        binary_override
            .map(|b| b.to_string())
            .unwrap_or_else(|| default.to_string())
    };
    match client {
        ClientKind::Claude => (
            binary("claude"),
            vec![
                "--print".to_string(),
                "--verbose".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--dangerously-skip-permissions".to_string(),
                "-p".to_string(),
                prompt.to_string(),
            ],
            None,
        ),
        ClientKind::Codex => (
            binary("codex"),
            vec!["--quiet".to_string(), "--full-auto".to_string()],
            Some(prompt.to_string()),
        ),
        ClientKind::Gemini => (
            binary("gemini"),
            vec!["--yolo".to_string(), "-p".to_string(), prompt.to_string()],
            None,
        ),
        ClientKind::Opencode => (
            binary("opencode"),
            vec!["run".to_string(), prompt.to_string()],
            None,
        ),
    }
}

/// Pull a human-readable activity description out of one stream-JSON stdout
/// line. Unparseable lines are not activity.
pub fn parse_activity(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let blocks = match value.get("type").and_then(|t| t.as_str()) {
        Some("assistant") => value.get("message")?.get("content")?.as_array()?.clone(),
        Some("tool_use") => vec![value.clone()],
        _ => return None,
    };
    for block in &blocks {
        if block.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
            continue;
        }
        let name = block.get("name").and_then(|n| n.as_str()).unwrap_or("tool");
        let input = block.get("input");
        let detail = input
            .and_then(|i| {
                i.get("file_path")
                    .or_else(|| i.get("path"))
                    .or_else(|| i.get("pattern"))
                    .or_else(|| i.get("command"))
            })
            .and_then(|d| d.as_str());
        return Some(match detail {
            Some(d) => {
                let mut d = d.to_string();
                if d.len() > 120 {
                    d.truncate(120);
                }
                format!("{name}: {d}")
            }
            None => name.to_string(),
        });
    }
    None
}

/// Launch one reviewer subprocess and supervise it to a single terminal
/// result (C2). Activity events stream to the bus as they happen; stdout
/// and stderr tails accumulate in `runtime`.
pub async fn run_reviewer(
    spec: LaunchSpec,
    runtime: Arc<RunnerRuntime>,
    bus: Arc<EventBus>,
    cancel: watch::Receiver<bool>,
) -> RunResult {
    let (command, args, stdin_data) =
        build_command(spec.client, spec.binary_override.as_deref(), &spec.prompt);

    let config = ProcessConfig {
        command,
        args,
        working_dir: spec.working_dir.clone(),
        env: vec![
            ("ARV_BASE".to_string(), spec.api_base.clone()),
            ("ARV_KEY".to_string(), spec.token.clone()),
            ("ARV_MODEL".to_string(), spec.model_id.clone()),
        ],
        stdin_data,
        deadline: Some(spec.deadline),
        grace: spec.grace,
        log_prefix: format!("reviewer:{}", spec.model_id),
    };

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    let activity_runtime = runtime.clone();
    let activity_bus = bus.clone();
    let session_id = spec.session_id.clone();
    let model_id = spec.model_id.clone();
    let activity_task = tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if let Some(description) = parse_activity(&line) {
                let event = ActivityEvent {
                    description: description.clone(),
                    timestamp: Utc::now(),
                };
                activity_runtime.record_activity(event);
                activity_bus.publish(
                    &session_id,
                    SessionEvent::AgentActivity {
                        model_id: model_id.clone(),
                        description,
                        timestamp: Utc::now(),
                    },
                );
            }
        }
    });

    info!(
        session_id = %spec.session_id,
        model_id = %spec.model_id,
        client = %spec.client,
        "launching reviewer"
    );

    let result =
        process::spawn_and_stream(config, runtime.tails.clone(), cancel, Some(line_tx)).await;
    let _ = activity_task.await;

    match result {
        Ok(output) => {
            let failure = match output.reason {
                ExitReason::DeadlineExceeded => Some("review deadline exceeded".to_string()),
                ExitReason::Cancelled => None,
                ExitReason::Exited if output.exit_code != 0 => {
                    Some(format!("exited with code {}", output.exit_code))
                }
                ExitReason::Exited => None,
            };
            RunResult {
                reason: output.reason,
                exit_code: output.exit_code,
                failure,
            }
        }
        Err(e) => RunResult {
            reason: ExitReason::Exited,
            exit_code: -1,
            failure: Some(e.to_string()),
        },
    }
}

/// Create the cancellation handle + receiver pair for a launch.
pub fn handle_for(model_id: &str, runtime: Arc<RunnerRuntime>) -> (RunnerHandle, watch::Receiver<bool>) {
    let (cancel_tx, cancel_rx) = process::cancel_pair();
    (
        RunnerHandle {
            model_id: model_id.to_string(),
            runtime,
            cancel: cancel_tx,
        },
        cancel_rx,
    )
}
