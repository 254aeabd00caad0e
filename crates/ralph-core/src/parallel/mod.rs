//! Parallel executor: a worker pool over isolated git worktrees.
//!
//! Up to `max_workers` single-task engine runs execute concurrently, each
//! in its own worktree on a dedicated branch. Completed branches flow into
//! the merge engine, which is a single sequential consumer: workers may
//! finish out of order, but merges happen in arrival order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{AgentPlugin, AgentRegistry, ExecuteOptions};
use crate::config::RunConfig;
use crate::engine::{Engine, IterationResult};
use crate::git;
use crate::merge::{MergeEngine, MergeEvent, MergeStatus};
use crate::tracker::{Task, TrackerRegistry};
use crate::worktree::{WorktreeConfig, WorktreeManager};

/// How a merge conflict is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictMode {
    /// Delegate one bounded resolution attempt to an agent.
    AiResolve,
    /// Emit the conflict event and leave the branch for the operator.
    Manual,
    /// Abandon this task's merge (already aborted and rolled back).
    AbortTask,
    /// Roll the whole session back and stop.
    RollbackSession,
}

/// Configuration for a parallel run.
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    pub max_workers: usize,
    pub conflict_mode: ConflictMode,
    pub worktree: WorktreeConfig,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            conflict_mode: ConflictMode::Manual,
            worktree: WorktreeConfig::default(),
        }
    }
}

/// What one worker produced.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub worker_id: usize,
    pub task: Task,
    pub branch_name: String,
    pub worktree_id: String,
    pub success: bool,
    pub iteration: Option<IterationResult>,
    pub error: Option<String>,
}

/// Events emitted during a parallel run.
#[derive(Debug, Clone)]
pub enum ParallelEvent {
    WorkerStarted { worker_id: usize, task_id: String },
    WorkerCompleted { worker_id: usize, task_id: String },
    WorkerFailed {
        worker_id: usize,
        task_id: String,
        error: String,
    },
    Merge(MergeEvent),
}

/// Aggregate result of a parallel run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParallelOutcome {
    pub workers_run: usize,
    pub tasks_merged: usize,
    pub conflicts: usize,
    pub failed_workers: usize,
    pub rolled_back: bool,
}

type ParallelListener = Box<dyn Fn(&ParallelEvent) + Send + Sync>;

#[derive(Default)]
struct EventSink {
    listeners: Mutex<Vec<ParallelListener>>,
}

impl EventSink {
    fn emit(&self, event: &ParallelEvent) {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(event)))
                .is_err()
            {
                tracing::warn!("parallel event listener panicked");
            }
        }
    }
}

/// Orchestrates the worker pool, worktrees, and the merge queue.
pub struct ParallelExecutor {
    run_template: RunConfig,
    config: ParallelConfig,
    agents: Arc<AgentRegistry>,
    trackers: Arc<TrackerRegistry>,
    worktrees: Arc<WorktreeManager>,
    merge: MergeEngine,
    sink: Arc<EventSink>,
    cancel: CancellationToken,
}

impl ParallelExecutor {
    pub fn new(
        run_template: RunConfig,
        config: ParallelConfig,
        agents: Arc<AgentRegistry>,
        trackers: Arc<TrackerRegistry>,
    ) -> Result<Self> {
        let session_id = run_template
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let worktrees = Arc::new(
            WorktreeManager::new(&run_template.cwd, config.worktree.clone())
                .context("failed to set up worktree manager")?,
        );
        let mut merge = MergeEngine::new(&run_template.cwd, &session_id)
            .context("failed to set up merge engine")?;

        let sink = Arc::new(EventSink::default());
        let merge_sink = Arc::clone(&sink);
        merge.subscribe(move |event| {
            merge_sink.emit(&ParallelEvent::Merge(event.clone()));
        });

        Ok(Self {
            run_template,
            config,
            agents,
            trackers,
            worktrees,
            merge,
            sink,
            cancel: CancellationToken::new(),
        })
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&ParallelEvent) + Send + Sync + 'static,
    {
        self.sink
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(listener));
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Operations processed so far, in enqueue order.
    pub fn merge_operations(&self) -> Vec<crate::merge::MergeOperation> {
        self.merge.operations().into_iter().cloned().collect()
    }

    /// Run the given independent tasks to completion.
    pub async fn run(&mut self, tasks: Vec<Task>) -> Result<ParallelOutcome> {
        self.merge.create_session_backup()?;
        if let Err(e) = self.worktrees.ensure_gitignore() {
            tracing::warn!(error = %e, "failed to update .gitignore");
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let (tx, mut rx) = mpsc::channel::<WorkerResult>(self.config.max_workers * 2);
        let mut pending: VecDeque<Task> = tasks.into();
        let mut in_flight = 0usize;
        let mut next_worker_id = 0usize;
        let mut outcome = ParallelOutcome::default();

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!(remaining = in_flight, "parallel run cancelled, draining workers");
                let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
                while in_flight > 0 {
                    match tokio::time::timeout_at(deadline, rx.recv()).await {
                        Ok(Some(result)) => {
                            in_flight -= 1;
                            self.handle_worker_result(result, &mut outcome).await?;
                        }
                        _ => break,
                    }
                }
                return Ok(outcome);
            }

            // Admission: start workers while capacity and queued tasks exist.
            while semaphore.available_permits() > 0 {
                let Some(task) = pending.pop_front() else {
                    break;
                };
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .context("worker semaphore closed")?;

                let worker_id = next_worker_id;
                next_worker_id += 1;
                in_flight += 1;
                outcome.workers_run += 1;

                self.sink.emit(&ParallelEvent::WorkerStarted {
                    worker_id,
                    task_id: task.id.clone(),
                });

                let worktrees = Arc::clone(&self.worktrees);
                let agents = Arc::clone(&self.agents);
                let trackers = Arc::clone(&self.trackers);
                let template = self.run_template.clone();
                let tx = tx.clone();

                tokio::spawn(async move {
                    let result =
                        run_worker(worker_id, task, worktrees, agents, trackers, template).await;
                    drop(permit);
                    let _ = tx.send(result).await;
                });
            }

            if in_flight == 0 && pending.is_empty() {
                break;
            }

            tokio::select! {
                received = rx.recv() => {
                    if let Some(result) = received {
                        in_flight -= 1;
                        self.handle_worker_result(result, &mut outcome).await?;
                        if outcome.rolled_back {
                            self.cancel.cancel();
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    // Handled at the top of the next loop turn.
                }
            }
        }

        Ok(outcome)
    }

    async fn handle_worker_result(
        &mut self,
        result: WorkerResult,
        outcome: &mut ParallelOutcome,
    ) -> Result<()> {
        if !result.success {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "worker failed".to_string());
            tracing::warn!(
                worker_id = result.worker_id,
                task_id = %result.task.id,
                error = %error,
                "worker failed"
            );
            self.sink.emit(&ParallelEvent::WorkerFailed {
                worker_id: result.worker_id,
                task_id: result.task.id.clone(),
                error,
            });
            outcome.failed_workers += 1;
            return Ok(());
        }

        self.sink.emit(&ParallelEvent::WorkerCompleted {
            worker_id: result.worker_id,
            task_id: result.task.id.clone(),
        });

        let op_id = self.merge.enqueue(result);
        self.merge.process_all()?;

        let status = self.merge.get(op_id).map(|op| op.status);
        match status {
            Some(MergeStatus::Completed) => outcome.tasks_merged += 1,
            Some(MergeStatus::Conflicted) => {
                outcome.conflicts += 1;
                self.handle_conflict(op_id, outcome).await?;
            }
            Some(MergeStatus::Failed) => outcome.failed_workers += 1,
            _ => {}
        }
        Ok(())
    }

    async fn handle_conflict(&mut self, op_id: Uuid, outcome: &mut ParallelOutcome) -> Result<()> {
        match self.config.conflict_mode {
            // The conflict event is already on the bus; the branch is left
            // for the operator.
            ConflictMode::Manual => Ok(()),
            ConflictMode::AbortTask => {
                tracing::info!(op_id = %op_id, "conflicted merge abandoned");
                Ok(())
            }
            ConflictMode::RollbackSession => {
                self.merge.rollback_session()?;
                outcome.rolled_back = true;
                outcome.tasks_merged = 0;
                Ok(())
            }
            ConflictMode::AiResolve => {
                if self.attempt_ai_resolve(op_id).await? {
                    outcome.conflicts -= 1;
                    outcome.tasks_merged += 1;
                }
                Ok(())
            }
        }
    }

    /// One bounded resolution attempt: ask an agent to redo the merge in
    /// the main workspace and resolve the conflicted files. Verified by
    /// checking the branch is no longer ahead of HEAD.
    async fn attempt_ai_resolve(&mut self, op_id: Uuid) -> Result<bool> {
        let (branch, files, message) = {
            let op = self
                .merge
                .get(op_id)
                .context("conflicted operation disappeared")?;
            (
                op.source_branch.clone(),
                op.conflicted_files.clone().unwrap_or_default(),
                op.commit_message.clone(),
            )
        };

        tracing::info!(op_id = %op_id, branch = %branch, "delegating conflict resolution to agent");

        let agent = self
            .agents
            .create(&self.run_template.agent, &self.run_template.agent_config)
            .map_err(|e| e.context("failed to create agent for conflict resolution"))?;

        let prompt = format!(
            "Merge the git branch '{branch}' into the current branch.\n\
             A previous merge attempt conflicted in these files:\n{}\n\
             Run the merge again, resolve every conflict so both changes\n\
             survive where possible, and commit with the message:\n{message}\n\
             When the merge commit exists, print <promise>COMPLETE</promise>.",
            files
                .iter()
                .map(|f| format!("  - {f}"))
                .collect::<Vec<_>>()
                .join("\n"),
        );

        let mut options = ExecuteOptions::for_workspace(&self.run_template.cwd);
        options.timeout = self.run_template.iteration_timeout;
        options.env_excludes = self.run_template.env_excludes.clone();
        options.env_passthrough = self.run_template.env_passthrough.clone();

        let handle = agent.execute(&prompt, &[], &options).await?;
        let _ = handle.wait().await;

        let ahead = git::run_git(
            &self.run_template.cwd,
            &["rev-list", "--count", &format!("HEAD..{branch}")],
        )?;
        let resolved = ahead.trimmed() == "0";
        if resolved {
            tracing::info!(branch = %branch, "agent resolved the conflicted merge");
        } else {
            tracing::warn!(branch = %branch, "agent did not resolve the conflict; left for manual resolution");
        }
        Ok(resolved)
    }

    /// Remove all worker worktrees and branches.
    pub fn cleanup(&self) -> Result<()> {
        self.worktrees.cleanup_all()?;
        Ok(())
    }
}

/// One worker: acquire a worktree, run a single-task engine in it, release.
///
/// A worker never writes outside its own worktree; the worktree is released
/// (and its result recorded) even when the engine fails.
async fn run_worker(
    worker_id: usize,
    task: Task,
    worktrees: Arc<WorktreeManager>,
    agents: Arc<AgentRegistry>,
    trackers: Arc<TrackerRegistry>,
    template: RunConfig,
) -> WorkerResult {
    let failed = |error: String, worktree_id: String, task: Task| WorkerResult {
        worker_id,
        branch_name: WorktreeManager::branch_for_task(&task.id),
        worktree_id,
        task,
        success: false,
        iteration: None,
        error: Some(error),
    };

    let info = match worktrees.acquire(worker_id, &task.id) {
        Ok(info) => info,
        Err(e) => return failed(e.to_string(), String::new(), task),
    };

    let mut config = template.clone();
    config.cwd = info.path.clone();
    // The PRD travels with the repo; point the tracker at the worktree copy.
    if let Some(prd) = &template.prd_path {
        if let Ok(rel) = prd.strip_prefix(&template.cwd) {
            config.prd_path = Some(info.path.join(rel));
        }
    }
    config.only_task_id = Some(task.id.clone());
    config.max_iterations = 1;
    config.resume = false;
    config.force_lock = false;
    config.user_config_dir = None;
    config.session_id = Some(format!("worker-{worker_id}-{}", task.id));
    config.auto_commit = true;

    let result = match Engine::new(config, &agents, &trackers) {
        Ok(mut engine) => match engine.run().await {
            Ok(_) => {
                let iteration = engine.last_iteration().cloned();
                let completed = iteration
                    .as_ref()
                    .map(|i| i.task_completed)
                    .unwrap_or(false);
                WorkerResult {
                    worker_id,
                    task: task.clone(),
                    branch_name: info.branch.clone(),
                    worktree_id: info.id.clone(),
                    success: completed,
                    error: if completed {
                        None
                    } else {
                        Some("agent did not signal completion".to_string())
                    },
                    iteration,
                }
            }
            Err(e) => failed(format!("{e:#}"), info.id.clone(), task.clone()),
        },
        Err(e) => failed(format!("{e:#}"), info.id.clone(), task.clone()),
    };

    if let Err(e) = worktrees.release(&info.id) {
        tracing::warn!(worktree = %info.id, error = %e, "failed to release worktree");
    }
    result
}
