//! Child process runner.
//!
//! Spawns a child from an explicit argv list (no shell on any platform),
//! streams stdout/stderr as they arrive, enforces an optional timeout, and
//! escalates interrupts from SIGTERM to SIGKILL after a grace period.
//!
//! Prompts and other payloads are delivered via stdin so that shell
//! metacharacters round-trip unchanged.

pub mod envfilter;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long to wait after SIGTERM before sending SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(3);

/// Everything needed to spawn one child process.
///
/// The environment map is the *entire* environment the child will see; the
/// caller is expected to have run it through [`envfilter::EnvFilter`] first.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The child ran to exit (any exit code; see `exit_code`).
    Completed,
    /// The child could not be spawned or its output could not be read.
    Failed,
    /// The per-run timeout fired; the child was killed.
    Timeout,
    /// [`ProcessHandle::interrupt`] was called; the child was killed.
    Interrupted,
}

/// Final result of a run, including the fully buffered output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub execution_id: Uuid,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// A piece of child output, delivered in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

/// Handle to a running child.
///
/// Output streams through the channel returned by [`take_output`]; the
/// channel closes, and [`wait`] resolves, only after the last chunk has been
/// delivered.
///
/// [`take_output`]: ProcessHandle::take_output
/// [`wait`]: ProcessHandle::wait
pub struct ProcessHandle {
    pub execution_id: Uuid,
    output: Option<mpsc::Receiver<OutputChunk>>,
    done: oneshot::Receiver<RunResult>,
    cancel: CancellationToken,
}

impl ProcessHandle {
    /// Take the output stream. Returns `None` on the second call.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<OutputChunk>> {
        self.output.take()
    }

    /// Request termination: SIGTERM now, SIGKILL after [`KILL_GRACE`].
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// A clone of the interrupt token, for callers that hand the handle off.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Await the final result. All output chunks are delivered first.
    pub async fn wait(mut self) -> RunResult {
        // An unclaimed output stream must not backpressure the pumps.
        self.output = None;
        let execution_id = self.execution_id;
        self.done.await.unwrap_or_else(|_| {
            let now = Utc::now();
            RunResult {
                execution_id,
                status: RunStatus::Failed,
                exit_code: None,
                stdout: String::new(),
                stderr: "process driver task was dropped".to_string(),
                duration_ms: 0,
                started_at: now,
                ended_at: now,
            }
        })
    }
}

/// Spawn a child process per `spec`.
///
/// Never returns an error: a missing executable yields a handle whose result
/// has `status == Failed` and an explanatory stderr.
pub fn run(spec: CommandSpec) -> ProcessHandle {
    let execution_id = Uuid::new_v4();
    let (out_tx, out_rx) = mpsc::channel(256);
    let (done_tx, done_rx) = oneshot::channel();
    let cancel = CancellationToken::new();

    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let result = drive(execution_id, spec, out_tx, task_cancel).await;
        let _ = done_tx.send(result);
    });

    ProcessHandle {
        execution_id,
        output: Some(out_rx),
        done: done_rx,
        cancel,
    }
}

enum Exit {
    Done(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Interrupted,
}

async fn drive(
    execution_id: Uuid,
    spec: CommandSpec,
    out: mpsc::Sender<OutputChunk>,
    cancel: CancellationToken,
) -> RunResult {
    let started_at = Utc::now();
    let started = Instant::now();

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .env_clear()
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let ended_at = Utc::now();
            return RunResult {
                execution_id,
                status: RunStatus::Failed,
                exit_code: None,
                stdout: String::new(),
                stderr: format!(
                    "failed to spawn '{}': {e} -- is it installed and on PATH?",
                    spec.program
                ),
                duration_ms: started.elapsed().as_millis() as u64,
                started_at,
                ended_at,
            };
        }
    };

    // Deliver the payload via stdin and close it so the child sees EOF.
    // Bytes pass through untouched.
    if let Some(mut stdin) = child.stdin.take() {
        if let Some(payload) = &spec.stdin {
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                tracing::warn!(execution_id = %execution_id, error = %e, "failed to write child stdin");
            }
        }
        drop(stdin);
    }

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(pump(stdout_pipe, out.clone(), true));
    let stderr_task = tokio::spawn(pump(stderr_pipe, out, false));

    let sleeper = async {
        match spec.timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(sleeper);

    let exit = tokio::select! {
        res = child.wait() => Exit::Done(res),
        _ = &mut sleeper => Exit::TimedOut,
        _ = cancel.cancelled() => Exit::Interrupted,
    };

    let (status, exit_code) = match exit {
        Exit::Done(Ok(st)) => (RunStatus::Completed, st.code()),
        Exit::Done(Err(e)) => {
            tracing::warn!(execution_id = %execution_id, error = %e, "error waiting for child");
            (RunStatus::Failed, None)
        }
        Exit::TimedOut => (RunStatus::Timeout, terminate(&mut child).await),
        Exit::Interrupted => (RunStatus::Interrupted, terminate(&mut child).await),
    };

    // Join the pumps so every chunk produced before exit (or kill) has been
    // delivered and buffered before the result resolves.
    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    RunResult {
        execution_id,
        status,
        exit_code,
        stdout,
        stderr,
        duration_ms: started.elapsed().as_millis() as u64,
        started_at,
        ended_at: Utc::now(),
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child) -> Option<i32> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid came from a child we spawned.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(st)) => st.code(),
        _ => {
            let _ = child.kill().await;
            child.wait().await.ok().and_then(|st| st.code())
        }
    }
}

async fn pump<R>(
    stream: Option<R>,
    tx: mpsc::Sender<OutputChunk>,
    is_stdout: bool,
) -> String
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut collected = String::new();
    let Some(mut stream) = stream else {
        return collected;
    };

    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                collected.push_str(&text);
                let chunk = if is_stdout {
                    OutputChunk::Stdout(text)
                } else {
                    OutputChunk::Stderr(text)
                };
                // A dropped receiver is fine; we still buffer for the result.
                let _ = tx.send(chunk).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "error reading child output");
                break;
            }
        }
    }
    collected
}
