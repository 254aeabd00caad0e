//! Resolved run configuration.
//!
//! The core consumes this record as-is; flag and config-file parsing happen
//! in outer layers (the CLI, the remote control plane).

use std::path::PathBuf;
use std::time::Duration;

use crate::agent::AgentConfig;

/// What to do when an iteration fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStrategy {
    /// Record the failure and advance to the next task.
    Skip,
    /// Re-attempt the same task with linear backoff, then skip it.
    Retry { max_retries: u32, delay_ms: u64 },
    /// Stop the engine with a failure.
    Abort,
}

/// Fully resolved configuration for one engine run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Workspace the engine operates in.
    pub cwd: PathBuf,
    /// Agent plugin id (e.g. "claude").
    pub agent: String,
    pub agent_config: AgentConfig,
    /// Tracker plugin id (e.g. "json-prd").
    pub tracker: String,
    pub epic_id: Option<String>,
    pub prd_path: Option<PathBuf>,
    /// 0 means unlimited.
    pub max_iterations: u32,
    /// Pause between iterations.
    pub iteration_delay: Duration,
    /// Wall-clock budget per iteration.
    pub iteration_timeout: Option<Duration>,
    pub error_strategy: ErrorStrategy,
    /// Whether a non-zero agent exit still counts as a usable iteration.
    pub continue_on_non_zero_exit: bool,
    /// Commit the workspace after each completed task.
    pub auto_commit: bool,
    pub env_excludes: Vec<String>,
    pub env_passthrough: Vec<String>,
    /// Override a live (non-stale) session lock.
    pub force_lock: bool,
    /// Resume from persisted state instead of starting fresh.
    pub resume: bool,
    /// Restrict the run to a single task (used by parallel workers).
    pub only_task_id: Option<String>,
    /// Where the cross-workspace session registry lives; `None` disables
    /// registry updates (tests, workers).
    pub user_config_dir: Option<PathBuf>,
    /// Explicit session id; generated when `None`.
    pub session_id: Option<String>,
}

impl RunConfig {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            agent: "claude".to_string(),
            agent_config: AgentConfig::default(),
            tracker: "json-prd".to_string(),
            epic_id: None,
            prd_path: None,
            max_iterations: 0,
            iteration_delay: Duration::ZERO,
            iteration_timeout: None,
            error_strategy: ErrorStrategy::Skip,
            continue_on_non_zero_exit: false,
            auto_commit: true,
            env_excludes: Vec::new(),
            env_passthrough: Vec::new(),
            force_lock: false,
            resume: false,
            only_task_id: None,
            user_config_dir: None,
            session_id: None,
        }
    }
}
