use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Configuration for spawning a supervised child process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Payload piped to the child's stdin, then closed.
    pub stdin_data: Option<String>,
    /// Soft deadline; the process tree is killed when it elapses.
    pub deadline: Option<Duration>,
    /// Grace period between SIGTERM and SIGKILL.
    pub grace: Duration,
    pub log_prefix: String,
}

/// How a supervised process reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Exited,
    DeadlineExceeded,
    Cancelled,
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub reason: ExitReason,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none() && self.reason == ExitReason::Exited
    }
}

/// Byte-bounded line ring: keeps the most recent lines within a byte budget.
#[derive(Debug)]
pub struct Tail {
    cap_bytes: usize,
    bytes: usize,
    lines: VecDeque<String>,
}

impl Tail {
    pub fn new(cap_bytes: usize) -> Self {
        Self {
            cap_bytes,
            bytes: 0,
            lines: VecDeque::new(),
        }
    }

    pub fn push(&mut self, line: String) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > self.cap_bytes {
            match self.lines.pop_front() {
                Some(dropped) => self.bytes -= dropped.len() + 1,
                None => break,
            }
        }
    }

    pub fn snapshot(&self) -> String {
        let mut out = String::with_capacity(self.bytes);
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Shared stdout/stderr tails, readable while the process runs.
#[derive(Debug)]
pub struct OutputTails {
    pub stdout: Mutex<Tail>,
    pub stderr: Mutex<Tail>,
}

impl OutputTails {
    pub fn new(cap_bytes: usize) -> Self {
        Self {
            stdout: Mutex::new(Tail::new(cap_bytes)),
            stderr: Mutex::new(Tail::new(cap_bytes)),
        }
    }

    pub fn stdout_snapshot(&self) -> String {
        self.stdout.lock().expect("tail lock poisoned").snapshot()
    }

    pub fn stderr_snapshot(&self) -> String {
        self.stderr.lock().expect("tail lock poisoned").snapshot()
    }
}

/// Create a cancellation pair for a supervised process.
pub fn cancel_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

fn kill_group(pid: u32, signal: i32) {
    unsafe {
        libc::killpg(pid as i32, signal);
    }
}

/// SIGTERM the process group, give it `grace`, then SIGKILL and reap.
async fn terminate(
    child: &mut Child,
    pid: u32,
    grace: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    kill_group(pid, libc::SIGTERM);
    if let Ok(result) = tokio::time::timeout(grace, child.wait()).await {
        return result;
    }
    kill_group(pid, libc::SIGKILL);
    child.wait().await
}

/// Spawn a child in its own process group, stream its output into `tails`
/// (and each stdout line into `line_tx` when given), and supervise it until
/// exit, deadline, or cancellation. Exactly one terminal outcome.
pub async fn spawn_and_stream(
    config: ProcessConfig,
    tails: std::sync::Arc<OutputTails>,
    mut cancel: watch::Receiver<bool>,
    line_tx: Option<mpsc::UnboundedSender<String>>,
) -> Result<ProcessOutput> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if config.stdin_data.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Subprocess(format!("failed to spawn '{}': {e}", config.command)))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Subprocess("child has no pid".into()))?;

    if let Some(data) = config.stdin_data {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Subprocess("stdin is piped".into()))?;
        stdin
            .write_all(data.as_bytes())
            .await
            .map_err(|e| Error::Subprocess(format!("failed to write stdin: {e}")))?;
        drop(stdin);
    }

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");

    let prefix_out = config.log_prefix.clone();
    let tails_out = tails.clone();
    let stdout_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!("[{prefix_out}] {line}");
            if let Some(ref tx) = line_tx {
                let _ = tx.send(line.clone());
            }
            tails_out.stdout.lock().expect("tail lock poisoned").push(line);
        }
    });

    let prefix_err = config.log_prefix.clone();
    let tails_err = tails.clone();
    let stderr_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            warn!("[{prefix_err}] {line}");
            tails_err.stderr.lock().expect("tail lock poisoned").push(line);
        }
    });

    let deadline = async {
        match config.deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };

    enum Waited {
        Exited(std::io::Result<std::process::ExitStatus>),
        Cancelled,
        Deadline,
    }

    // Decide the outcome first; the select's borrow on `child` ends before
    // any kill path touches it again.
    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = cancel.changed() => Waited::Cancelled,
        _ = deadline => Waited::Deadline,
    };

    let (status, reason) = match waited {
        Waited::Exited(status) => {
            let status = status.map_err(|e| Error::Subprocess(format!("wait error: {e}")))?;
            (status, ExitReason::Exited)
        }
        Waited::Cancelled => {
            info!("[{}] stop requested, terminating pid {pid}", config.log_prefix);
            let status = terminate(&mut child, pid, config.grace)
                .await
                .map_err(|e| Error::Subprocess(format!("wait error: {e}")))?;
            (status, ExitReason::Cancelled)
        }
        Waited::Deadline => {
            warn!("[{}] deadline exceeded, terminating pid {pid}", config.log_prefix);
            let status = terminate(&mut child, pid, config.grace)
                .await
                .map_err(|e| Error::Subprocess(format!("wait error: {e}")))?;
            (status, ExitReason::DeadlineExceeded)
        }
    };

    // Readers drain to EOF once the child is gone.
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let (exit_code, signal) = extract_exit_info(&status);

    Ok(ProcessOutput {
        exit_code,
        signal,
        reason,
    })
}

fn extract_exit_info(status: &std::process::ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (-1, None)
}
