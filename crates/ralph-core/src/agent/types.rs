//! Supporting types for the agent plugin contract.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::process::RunResult;

/// Structured-output formats an adapter can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuredFormat {
    Jsonl,
}

/// Static capabilities of an agent adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMeta {
    pub id: String,
    pub name: String,
    pub default_command: String,
    pub supports_streaming: bool,
    pub supports_interrupt: bool,
    pub supports_file_context: bool,
    pub supports_subagent_tracing: bool,
    pub structured_output_format: Option<StructuredFormat>,
}

/// Result of probing whether the agent CLI is installed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DetectResult {
    pub available: bool,
    pub version: Option<String>,
    pub executable_path: Option<String>,
    pub error: Option<String>,
}

/// Result of the cheap end-to-end preflight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightResult {
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub suggestion: Option<String>,
}

/// One question the setup wizard would ask for this agent.
///
/// The wizard itself is an external collaborator; the core only carries the
/// contract shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupQuestion {
    pub key: String,
    pub prompt: String,
    pub default: Option<String>,
    pub secret: bool,
}

/// Plugin-specific configuration parsed by `initialize`.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    /// Override for the agent binary (path or name on PATH).
    pub command: Option<String>,
    pub model: Option<String>,
    /// Extra argv appended after the adapter's own flags.
    pub extra_args: Vec<String>,
}

/// Per-execution options handed to [`super::AgentPlugin::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub cwd: PathBuf,
    pub timeout: Option<Duration>,
    /// The parent environment as an explicit map; the adapter filters it
    /// before spawn. Tests pass a constructed map and never touch the real
    /// process environment.
    pub parent_env: HashMap<String, String>,
    /// User-supplied exclude patterns, unioned with the defaults.
    pub env_excludes: Vec<String>,
    /// User-supplied passthrough patterns.
    pub env_passthrough: Vec<String>,
    /// Variables added after filtering (deliberate, e.g. per-run markers).
    pub extra_env: HashMap<String, String>,
}

impl ExecuteOptions {
    /// Options for a workspace, capturing the current process environment.
    pub fn for_workspace(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            timeout: None,
            parent_env: std::env::vars().collect(),
            env_excludes: Vec::new(),
            env_passthrough: Vec::new(),
            extra_env: HashMap::new(),
        }
    }
}

/// Events streamed from a running agent, in order.
///
/// The `Ended` event fires strictly after the last output event; a consumer
/// that stopped listening never blocks result resolution.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Started { execution_id: Uuid },
    Stdout(String),
    Stderr(String),
    /// One parsed object from the agent's JSONL stream (only for adapters
    /// with `structured_output_format: Some(Jsonl)`).
    Jsonl(Value),
    Ended(RunResult),
}

/// Alias: the process-level result doubles as the agent execution result.
pub type AgentExecutionResult = RunResult;

/// Handle to a running agent execution: an event stream plus a single
/// completion value.
pub struct AgentHandle {
    pub execution_id: Uuid,
    pub(crate) events: Option<mpsc::Receiver<ExecutionEvent>>,
    pub(crate) done: oneshot::Receiver<AgentExecutionResult>,
    pub(crate) cancel: CancellationToken,
}

impl AgentHandle {
    /// Take the event stream. Returns `None` on the second call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ExecutionEvent>> {
        self.events.take()
    }

    /// Request termination (SIGTERM, then SIGKILL after the grace period).
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    /// Await the final result; resolves after the `Ended` event was queued.
    pub async fn wait(mut self) -> AgentExecutionResult {
        // An unclaimed event stream must not backpressure the pump task.
        self.events = None;
        let execution_id = self.execution_id;
        self.done.await.unwrap_or_else(|_| {
            let now = chrono::Utc::now();
            AgentExecutionResult {
                execution_id,
                status: crate::process::RunStatus::Failed,
                exit_code: None,
                stdout: String::new(),
                stderr: "agent stream task was dropped".to_string(),
                duration_ms: 0,
                started_at: now,
                ended_at: now,
            }
        })
    }
}
