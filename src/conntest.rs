use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::auth::mint_token;
use crate::error::Result;
use crate::model::ClientKind;
use crate::process::{self, OutputTails, ProcessConfig};
use crate::prompts::PromptEngine;
use crate::runner::build_command;

/// Events streamed to the caller while a probe runs (NDJSON on the wire).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestEvent {
    Started {
        token: String,
    },
    /// The probe subprocess finished (the callback may still be pending).
    TriggerDone {
        exit_code: i32,
    },
    Result {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// One-shot reviewer liveness probe (C10). Launches the chosen client with a
/// prompt that tells it to call back, then waits for the callback or the
/// timeout. Nothing is ever persisted.
pub struct ConnectionTester {
    pending: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl ConnectionTester {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a probe; events arrive on the returned channel, ending with a
    /// terminal `Result`.
    pub fn begin(
        self: &Arc<Self>,
        client: ClientKind,
        binary_override: Option<String>,
        prompts: &PromptEngine,
        callback_url: String,
        timeout: Duration,
        grace: Duration,
    ) -> Result<mpsc::Receiver<TestEvent>> {
        let token = mint_token();
        let marker = mint_token()[..8].to_string();

        let vars = HashMap::from([
            ("callback_url".to_string(), callback_url),
            ("token".to_string(), token.clone()),
            ("marker".to_string(), marker),
        ]);
        let prompt = prompts.render("connection-test", &vars)?;

        let (done_tx, done_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(token.clone(), done_tx);

        let (event_tx, event_rx) = mpsc::channel(8);
        let tester = Arc::clone(self);
        tokio::spawn(async move {
            tester
                .drive(client, binary_override, prompt, token, timeout, grace, event_tx, done_rx)
                .await;
        });
        Ok(event_rx)
    }

    /// Callback from the probed client. Single use: the token is consumed.
    pub fn callback(&self, token: &str) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(token);
        match sender {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        client: ClientKind,
        binary_override: Option<String>,
        prompt: String,
        token: String,
        timeout: Duration,
        grace: Duration,
        event_tx: mpsc::Sender<TestEvent>,
        done_rx: oneshot::Receiver<()>,
    ) {
        let _ = event_tx
            .send(TestEvent::Started {
                token: token.clone(),
            })
            .await;

        let (command, args, stdin_data) = build_command(client, binary_override.as_deref(), &prompt);
        let config = ProcessConfig {
            command,
            args,
            working_dir: std::env::temp_dir(),
            env: vec![],
            stdin_data,
            deadline: Some(timeout),
            grace,
            log_prefix: format!("conntest:{client}"),
        };

        let tails = Arc::new(OutputTails::new(8 * 1024));
        let (_cancel_tx, cancel_rx) = process::cancel_pair();
        let trigger_tx = event_tx.clone();
        let subprocess = tokio::spawn(async move {
            let result = process::spawn_and_stream(config, tails, cancel_rx, None).await;
            if let Ok(ref output) = result {
                let _ = trigger_tx
                    .send(TestEvent::TriggerDone {
                        exit_code: output.exit_code,
                    })
                    .await;
            }
            result
        });

        let outcome = tokio::time::timeout(timeout, done_rx).await;
        // Token is spent either way; a late callback must not fire.
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&token);

        let event = match outcome {
            Ok(Ok(())) => {
                info!(client = %client, "connection test callback received");
                TestEvent::Result {
                    status: "ok".to_string(),
                    reason: None,
                }
            }
            Ok(Err(_)) => TestEvent::Result {
                status: "failed".to_string(),
                reason: Some("probe aborted".to_string()),
            },
            Err(_) => {
                let reason = match subprocess.await {
                    Ok(Ok(output)) if !output.success() => {
                        format!("no callback; client exited with code {}", output.exit_code)
                    }
                    Ok(Err(e)) => format!("no callback; {e}"),
                    _ => format!("no callback within {}s", timeout.as_secs()),
                };
                TestEvent::Result {
                    status: "failed".to_string(),
                    reason: Some(reason),
                }
            }
        };
        let _ = event_tx.send(event).await;
    }
}

impl Default for ConnectionTester {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard against the tester ever holding a stale entry.
pub fn pending_is_empty(tester: &ConnectionTester) -> bool {
    tester
        .pending
        .lock()
        .expect("pending lock poisoned")
        .is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_binary(dir: &std::path::Path, script: &str) -> String {
        let path = dir.join("fake-client");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    async fn next(rx: &mut mpsc::Receiver<TestEvent>) -> TestEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_callback_yields_ok() {
        let dir = tempfile::TempDir::new().unwrap();
        let binary = fake_binary(dir.path(), "exit 0");
        let tester = Arc::new(ConnectionTester::new());
        let prompts = PromptEngine::new(None);

        let mut rx = tester
            .begin(
                ClientKind::Claude,
                Some(binary),
                &prompts,
                "http://localhost:3000/api/agents/connection-test/callback".to_string(),
                Duration::from_secs(30),
                Duration::from_millis(200),
            )
            .unwrap();

        let token = match next(&mut rx).await {
            TestEvent::Started { token } => token,
            other => panic!("expected started, got {other:?}"),
        };
        assert!(tester.callback(&token));
        // A token is single use.
        assert!(!tester.callback(&token));

        // TriggerDone may interleave before the result; scan to the terminal.
        loop {
            match next(&mut rx).await {
                TestEvent::Result { status, .. } => {
                    assert_eq!(status, "ok");
                    break;
                }
                TestEvent::TriggerDone { exit_code } => assert_eq!(exit_code, 0),
                TestEvent::Started { .. } => panic!("duplicate started"),
            }
        }
        assert!(pending_is_empty(&tester));
    }

    #[tokio::test]
    async fn test_no_callback_times_out_failed() {
        let dir = tempfile::TempDir::new().unwrap();
        let binary = fake_binary(dir.path(), "exit 0");
        let tester = Arc::new(ConnectionTester::new());
        let prompts = PromptEngine::new(None);

        let mut rx = tester
            .begin(
                ClientKind::Claude,
                Some(binary),
                &prompts,
                "http://localhost:3000/cb".to_string(),
                Duration::from_millis(300),
                Duration::from_millis(100),
            )
            .unwrap();

        loop {
            match next(&mut rx).await {
                TestEvent::Result { status, reason } => {
                    assert_eq!(status, "failed");
                    assert!(reason.unwrap().contains("no callback"));
                    break;
                }
                _ => continue,
            }
        }
        assert!(pending_is_empty(&tester));
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let tester = ConnectionTester::new();
        assert!(!tester.callback("tok-never-issued"));
    }
}
