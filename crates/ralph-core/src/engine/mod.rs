//! Execution engine: the single-agent iteration state machine.
//!
//! One loop turn = select task → render prompt → run agent → observe its
//! stream → complete/commit → persist. Stopping is cooperative: `stop()`
//! lets the current iteration finish. A crashed run resumes from the
//! persisted state in `<workspace>/.ralph-tui/session.json`.

pub mod events;

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{
    AgentExecutionResult, AgentPlugin, AgentRegistry, ExecuteOptions, ExecutionEvent,
};
use crate::config::{ErrorStrategy, RunConfig};
use crate::git::commit::auto_commit;
use crate::parser::{AgentEvent, OutputParser};
use crate::process::RunStatus;
use crate::progress::{IterationRecord, ProgressLog, contains_completion_marker};
use crate::session::lock::{self, LockError, SessionLockGuard};
use crate::session::registry::{SessionEntry, SessionRegistry};
use crate::session::state::{
    self, IterationSummary, PersistedSessionState, SessionStatus, TaskSnapshot,
};
use crate::subagent::{SubagentTracker, SubagentUpdate};
use crate::template::{PromptVars, render_prompt};
use crate::tracker::{Task, TaskFilter, TaskStatus, TrackerConfig, TrackerPlugin, TrackerRegistry};

pub use events::{EngineEvent, EventBus, StopReason};

/// Everything observed during one loop turn. Immutable after emission.
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub iteration: u32,
    pub task: Task,
    pub task_completed: bool,
    pub agent_result: AgentExecutionResult,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub agent_events: Vec<AgentEvent>,
}

impl IterationResult {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("agent preflight failed: {error}")]
    Preflight {
        error: String,
        suggestion: Option<String>,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("plugin error: {0}")]
    Plugin(#[source] anyhow::Error),

    #[error("engine aborted: {0}")]
    Aborted(String),

    #[error("persistence error: {0}")]
    Io(#[from] std::io::Error),
}

/// Observable engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Initializing,
    Running,
    Waiting,
    Stopping,
}

/// What a finished run looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub reason: StopReason,
    pub iterations_run: u32,
    pub tasks_completed: usize,
    pub session_id: String,
}

/// The single-agent execution engine.
pub struct Engine {
    config: RunConfig,
    agent: Box<dyn AgentPlugin>,
    tracker: Box<dyn TrackerPlugin>,
    bus: EventBus,
    cancel: CancellationToken,
    state: EngineState,
    session_id: String,
    persisted: Option<PersistedSessionState>,
    lock: Option<SessionLockGuard>,
    progress: ProgressLog,
    registry: Option<SessionRegistry>,
    tasks: Vec<Task>,
    skipped: HashSet<String>,
    attempts: HashMap<String, u32>,
    last_iteration: Option<IterationResult>,
}

impl Engine {
    /// Instantiate plugins from the registries and wire the engine up.
    /// Nothing touches the workspace until [`run`].
    ///
    /// [`run`]: Engine::run
    pub fn new(
        config: RunConfig,
        agents: &AgentRegistry,
        trackers: &TrackerRegistry,
    ) -> Result<Self, EngineError> {
        let agent = agents
            .create(&config.agent, &config.agent_config)
            .map_err(EngineError::Plugin)?;

        let tracker_config = TrackerConfig {
            cwd: config.cwd.clone(),
            epic_id: config.epic_id.clone(),
            prd_path: config.prd_path.clone(),
        };
        let tracker = trackers
            .create(&config.tracker, &tracker_config)
            .map_err(EngineError::Plugin)?;

        let registry = config
            .user_config_dir
            .as_deref()
            .map(SessionRegistry::in_config_dir);
        let progress = ProgressLog::for_workspace(&config.cwd);
        let session_id = config
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(Self {
            config,
            agent,
            tracker,
            bus: EventBus::new(),
            cancel: CancellationToken::new(),
            state: EngineState::Idle,
            session_id,
            persisted: None,
            lock: None,
            progress,
            registry,
            tasks: Vec::new(),
            skipped: HashSet::new(),
            attempts: HashMap::new(),
            last_iteration: None,
        })
    }

    /// The most recent iteration's full result, if any iteration ran.
    pub fn last_iteration(&self) -> Option<&IterationResult> {
        self.last_iteration.as_ref()
    }

    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(listener);
    }

    /// Cooperative stop: the current iteration finishes, no new one starts.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run to completion (or cancellation / abort).
    pub async fn run(&mut self) -> Result<RunOutcome, EngineError> {
        if let Err(e) = self.initialize().await {
            self.state = EngineState::Idle;
            self.lock = None;
            return Err(e);
        }

        self.bus.emit(&EngineEvent::Started {
            session_id: self.session_id.clone(),
        });

        let outcome = self.run_loop().await;
        self.state = EngineState::Stopping;
        self.finalize(&outcome);
        self.lock = None;
        self.state = EngineState::Idle;

        if let Ok(out) = &outcome {
            self.bus.emit(&EngineEvent::Stopped { reason: out.reason });
        } else {
            self.bus.emit(&EngineEvent::Stopped {
                reason: StopReason::Aborted,
            });
        }
        outcome
    }

    async fn initialize(&mut self) -> Result<(), EngineError> {
        self.state = EngineState::Initializing;

        // Preflight is fatal: an agent that cannot produce output would
        // burn iterations silently.
        let preflight = self.agent.preflight().await;
        if !preflight.success {
            return Err(EngineError::Preflight {
                error: preflight
                    .error
                    .unwrap_or_else(|| "preflight failed".to_string()),
                suggestion: preflight.suggestion,
            });
        }

        if self.config.resume {
            let restored = state::load(&self.config.cwd)
                .filter(|s| s.is_resumable())
                .ok_or_else(|| {
                    EngineError::Config(format!(
                        "no resumable session in {}",
                        self.config.cwd.display()
                    ))
                })?;
            self.session_id = restored.session_id.clone();
            self.persisted = Some(restored);
        }

        self.lock = Some(lock::acquire(
            &self.config.cwd,
            &self.session_id,
            self.config.force_lock,
        )?);

        let filter = TaskFilter {
            statuses: vec![TaskStatus::Open, TaskStatus::InProgress],
            labels: Vec::new(),
            epic_id: self.config.epic_id.clone(),
        };
        let mut tasks = self
            .tracker
            .get_tasks(Some(&filter))
            .await
            .map_err(EngineError::Plugin)?;

        if let Some(only) = &self.config.only_task_id {
            tasks.retain(|t| &t.id == only);
        }

        match &mut self.persisted {
            Some(restored) => {
                // Already-completed tasks are skipped on resume.
                let done: HashSet<String> = restored
                    .tasks
                    .iter()
                    .filter(|t| t.completed)
                    .map(|t| t.id.clone())
                    .collect();
                tasks.retain(|t| !done.contains(&t.id));
                restored.status = SessionStatus::Running;
            }
            None => {
                self.persisted = Some(PersistedSessionState {
                    session_id: self.session_id.clone(),
                    agent_plugin: self.config.agent.clone(),
                    model: self.config.agent_config.model.clone(),
                    tracker_plugin: self.config.tracker.clone(),
                    epic_id: self.config.epic_id.clone(),
                    prd_path: self.config.prd_path.clone(),
                    max_iterations: self.config.max_iterations,
                    cwd: self.config.cwd.clone(),
                    started_at: Utc::now(),
                    status: SessionStatus::Running,
                    tasks: tasks.iter().map(TaskSnapshot::from_task).collect(),
                    current_iteration: 0,
                    iteration_history: Vec::new(),
                });
            }
        }

        self.tasks = tasks;
        self.persist();
        self.update_registry(SessionStatus::Running);

        tracing::info!(
            session_id = %self.session_id,
            agent = %self.config.agent,
            tracker = %self.config.tracker,
            tasks = self.tasks.len(),
            resumed = self.config.resume,
            "engine initialized"
        );
        Ok(())
    }

    async fn run_loop(&mut self) -> Result<RunOutcome, EngineError> {
        self.state = EngineState::Running;
        let mut iterations_run = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.outcome(StopReason::Cancelled, iterations_run));
            }

            let current = self.current_iteration();
            if self.config.max_iterations > 0 && current >= self.config.max_iterations {
                return Ok(self.outcome(StopReason::MaxIterations, iterations_run));
            }

            let Some(task) = self.select_next_task() else {
                self.bus.emit(&EngineEvent::AllComplete);
                return Ok(self.outcome(StopReason::AllComplete, iterations_run));
            };

            let iteration = current + 1;
            self.bus.emit(&EngineEvent::IterationStarted {
                iteration,
                task_id: task.id.clone(),
            });

            let result = self.run_iteration(iteration, &task).await;
            iterations_run += 1;
            self.last_iteration = Some(result.clone());

            // Progress-log append happens before the session-state write for
            // the same iteration, and both complete before the next turn.
            if let Err(e) = self.progress.append_iteration(&IterationRecord {
                iteration,
                success: result.success(),
                task_id: &task.id,
                task_title: &task.title,
                duration_ms: result.duration_ms,
                output: &result.agent_result.stdout,
            }) {
                tracing::warn!(error = %e, "failed to append progress log");
            }

            if let Some(persisted) = &mut self.persisted {
                persisted.current_iteration = iteration;
                persisted.iteration_history.push(IterationSummary {
                    iteration,
                    task_id: task.id.clone(),
                    task_title: task.title.clone(),
                    success: result.success(),
                    task_completed: result.task_completed,
                    duration_ms: result.duration_ms,
                    error: result.error.clone(),
                    finished_at: Utc::now(),
                });
                if result.task_completed {
                    persisted.mark_task_completed(&task.id);
                }
            }
            self.persist();

            if result.success() {
                self.attempts.remove(&task.id);
                self.bus.emit(&EngineEvent::IterationCompleted {
                    iteration,
                    task_id: task.id.clone(),
                    task_completed: result.task_completed,
                });
                if !result.task_completed {
                    // Multi-turn work: the task stays in progress and is
                    // re-selected next turn.
                    if let Some(t) = self.tasks.iter_mut().find(|t| t.id == task.id) {
                        t.status = TaskStatus::InProgress;
                    }
                }
            } else {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                self.bus.emit(&EngineEvent::IterationFailed {
                    iteration,
                    task_id: task.id.clone(),
                    error: error.clone(),
                });

                match self.config.error_strategy {
                    ErrorStrategy::Skip => {
                        self.skipped.insert(task.id.clone());
                    }
                    ErrorStrategy::Retry {
                        max_retries,
                        delay_ms,
                    } => {
                        let attempt = self.attempts.entry(task.id.clone()).or_insert(0);
                        *attempt += 1;
                        if *attempt > max_retries {
                            tracing::warn!(
                                task_id = %task.id,
                                attempts = *attempt,
                                "retries exhausted, skipping task"
                            );
                            self.skipped.insert(task.id.clone());
                        } else {
                            let backoff =
                                std::time::Duration::from_millis(delay_ms * *attempt as u64);
                            self.wait(backoff).await;
                        }
                    }
                    ErrorStrategy::Abort => {
                        return Err(EngineError::Aborted(error));
                    }
                }
            }

            if !self.config.iteration_delay.is_zero() {
                self.wait(self.config.iteration_delay).await;
            }
        }
    }

    /// One loop turn against one task. Infallible by design: every failure
    /// mode lands in the result's `error` for the strategy to judge.
    async fn run_iteration(&self, iteration: u32, task: &Task) -> IterationResult {
        let started = Instant::now();
        let empty_result = |error: String| AgentExecutionResult {
            execution_id: Uuid::new_v4(),
            status: RunStatus::Failed,
            exit_code: None,
            stdout: String::new(),
            stderr: error,
            duration_ms: 0,
            started_at: Utc::now(),
            ended_at: Utc::now(),
        };

        // Render the prompt from the tracker's template.
        let progress_summary = self.progress.recent_entries(3).join("\n\n");
        let codebase_patterns = self.progress.codebase_patterns();
        let prd_context = match self.tracker.prd_context().await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(error = %e, "tracker prd_context failed, continuing without");
                None
            }
        };

        let vars = PromptVars {
            task,
            iteration,
            total_iterations: self.config.max_iterations,
            progress_summary,
            codebase_patterns,
            prd_context: prd_context.as_ref(),
        };
        let prompt = match render_prompt(&self.tracker.template(), &vars) {
            Ok(prompt) => prompt,
            Err(e) => {
                return IterationResult {
                    iteration,
                    task: task.clone(),
                    task_completed: false,
                    agent_result: empty_result(format!("{e:#}")),
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(format!("prompt rendering failed: {e:#}")),
                    agent_events: Vec::new(),
                };
            }
        };

        let mut options = ExecuteOptions::for_workspace(&self.config.cwd);
        options.timeout = self.config.iteration_timeout;
        options.env_excludes = self.config.env_excludes.clone();
        options.env_passthrough = self.config.env_passthrough.clone();
        options
            .extra_env
            .insert("RALPH_SESSION_ID".to_string(), self.session_id.clone());
        options
            .extra_env
            .insert("RALPH_ITERATION".to_string(), iteration.to_string());

        let mut handle = match self.agent.execute(&prompt, &[], &options).await {
            Ok(handle) => handle,
            Err(e) => {
                return IterationResult {
                    iteration,
                    task: task.clone(),
                    task_completed: false,
                    agent_result: empty_result(format!("{e:#}")),
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(format!("agent spawn failed: {e:#}")),
                    agent_events: Vec::new(),
                };
            }
        };

        // Observe the stream: normalize events, trace subagents.
        let mut parser = self.agent.make_parser();
        let mut trace = SubagentTracker::new();
        let mut agent_events: Vec<AgentEvent> = Vec::new();

        if let Some(mut rx) = handle.take_events() {
            while let Some(event) = rx.recv().await {
                if let ExecutionEvent::Stdout(text) = event {
                    for parsed in parser.push(&text) {
                        self.observe_subagents(&mut trace, &parsed);
                        agent_events.push(parsed);
                    }
                }
            }
        }
        for parsed in parser.flush() {
            self.observe_subagents(&mut trace, &parsed);
            agent_events.push(parsed);
        }

        let agent_result = handle.wait().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut error = None;
        let mut task_completed = false;
        match agent_result.status {
            RunStatus::Completed => {
                let exit_code = agent_result.exit_code.unwrap_or(-1);
                if exit_code != 0 && !self.config.continue_on_non_zero_exit {
                    error = Some(format!("agent exited with code {exit_code}"));
                } else {
                    task_completed = contains_completion_marker(&agent_result.stdout);
                }
            }
            RunStatus::Timeout => error = Some("timeout".to_string()),
            RunStatus::Interrupted => error = Some("interrupted".to_string()),
            RunStatus::Failed => {
                error = Some(if agent_result.stderr.trim().is_empty() {
                    "agent failed to run".to_string()
                } else {
                    agent_result.stderr.trim().to_string()
                });
            }
        }

        if task_completed {
            match self
                .tracker
                .complete_task(&task.id, Some("completion marker emitted"))
                .await
            {
                Ok(result) if !result.success => {
                    tracing::warn!(
                        task_id = %task.id,
                        error = ?result.error,
                        "tracker did not record completion; keeping local record"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "tracker complete_task failed");
                }
            }

            if self.config.auto_commit {
                match auto_commit(&self.config.cwd, &task.id, &task.title) {
                    Ok(outcome) if outcome.committed => {
                        tracing::info!(
                            task_id = %task.id,
                            sha = outcome.sha.as_deref().unwrap_or(""),
                            "auto-committed iteration"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Non-fatal: the work exists even if uncommitted.
                        tracing::warn!(task_id = %task.id, error = %e, "auto-commit failed");
                    }
                }
            }
        }

        IterationResult {
            iteration,
            task: task.clone(),
            task_completed,
            agent_result,
            duration_ms,
            error,
            agent_events,
        }
    }

    fn observe_subagents(&self, trace: &mut SubagentTracker, event: &AgentEvent) {
        match trace.observe(event) {
            Some(SubagentUpdate::Spawned { id }) => {
                if let Some(node) = trace.get(&id) {
                    self.bus.emit(&EngineEvent::SubagentSpawned {
                        node_id: id,
                        agent_type: node.agent_type.clone(),
                        depth: node.depth,
                    });
                }
            }
            Some(SubagentUpdate::Finished { id }) => {
                if let Some(node) = trace.get(&id) {
                    self.bus.emit(&EngineEvent::SubagentFinished {
                        node_id: id,
                        status: node.status,
                    });
                }
            }
            None => {}
        }
    }

    /// Highest-priority workable task; ties break on oldest update, then id.
    fn select_next_task(&self) -> Option<Task> {
        let completed: HashSet<&str> = self
            .persisted
            .as_ref()
            .map(|p| {
                p.tasks
                    .iter()
                    .filter(|t| t.completed)
                    .map(|t| t.id.as_str())
                    .collect()
            })
            .unwrap_or_default();

        select_task(&self.tasks, &completed, &self.skipped).cloned()
    }

    fn current_iteration(&self) -> u32 {
        self.persisted
            .as_ref()
            .map(|p| p.current_iteration)
            .unwrap_or(0)
    }

    fn outcome(&self, reason: StopReason, iterations_run: u32) -> RunOutcome {
        RunOutcome {
            reason,
            iterations_run,
            tasks_completed: self
                .persisted
                .as_ref()
                .map(|p| p.tasks_completed())
                .unwrap_or(0),
            session_id: self.session_id.clone(),
        }
    }

    fn persist(&self) {
        if let Some(persisted) = &self.persisted {
            if let Err(e) = state::save(&self.config.cwd, persisted) {
                // Logged, not fatal: the next iteration retries the write.
                tracing::error!(error = %e, "failed to persist session state");
            }
        }
    }

    fn update_registry(&self, status: SessionStatus) {
        let Some(registry) = &self.registry else {
            return;
        };
        let entry = SessionEntry {
            session_id: self.session_id.clone(),
            cwd: self.config.cwd.clone(),
            status,
            agent_plugin: self.config.agent.clone(),
            tracker_plugin: self.config.tracker.clone(),
            started_at: self
                .persisted
                .as_ref()
                .map(|p| p.started_at)
                .unwrap_or_else(Utc::now),
            updated_at: Utc::now(),
        };
        if let Err(e) = registry.upsert(entry) {
            tracing::warn!(error = %e, "failed to update session registry");
        }
    }

    fn finalize(&mut self, outcome: &Result<RunOutcome, EngineError>) {
        let status = match outcome {
            Ok(out) => match out.reason {
                StopReason::AllComplete => SessionStatus::Completed,
                StopReason::MaxIterations => SessionStatus::Paused,
                StopReason::Cancelled => SessionStatus::Interrupted,
                StopReason::Aborted => SessionStatus::Failed,
            },
            Err(_) => SessionStatus::Failed,
        };

        if let Some(persisted) = &mut self.persisted {
            persisted.status = status;
        }

        if status == SessionStatus::Completed {
            // A finished session leaves nothing to resume.
            if let Err(e) = state::remove(&self.config.cwd) {
                tracing::warn!(error = %e, "failed to remove session state");
            }
        } else {
            self.persist();
        }
        self.update_registry(status);
    }

    async fn wait(&mut self, duration: std::time::Duration) {
        self.state = EngineState::Waiting;
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel.cancelled() => {}
        }
        self.state = EngineState::Running;
    }
}

/// Selection rule, factored out for testing: lowest priority value wins,
/// then oldest `updated_at` (missing counts as oldest), then id.
fn select_task<'a>(
    tasks: &'a [Task],
    completed: &HashSet<&str>,
    skipped: &HashSet<String>,
) -> Option<&'a Task> {
    tasks
        .iter()
        .filter(|t| {
            t.status.is_workable()
                && !completed.contains(t.id.as_str())
                && !skipped.contains(&t.id)
        })
        .min_by(|a, b| {
            let a_updated = a.updated_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
            let b_updated = b.updated_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
            a.priority
                .cmp(&b.priority)
                .then(a_updated.cmp(&b_updated))
                .then(a.id.cmp(&b.id))
        })
}
