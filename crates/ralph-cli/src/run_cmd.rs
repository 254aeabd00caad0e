//! `ralph run` / `ralph resume`: drive the execution engine, or the
//! parallel executor when `--workers` is set.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;

use ralph_core::agent::{AgentConfig, AgentRegistry};
use ralph_core::parallel::{ConflictMode, ParallelConfig, ParallelEvent, ParallelExecutor};
use ralph_core::session::state;
use ralph_core::tracker::{TaskFilter, TaskStatus, TrackerConfig, TrackerPlugin, TrackerRegistry};
use ralph_core::worktree::WorktreeConfig;
use ralph_core::{Engine, EngineEvent, ErrorStrategy, RunConfig, StopReason};

use crate::config;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Agent plugin to drive
    #[arg(long, default_value = "claude")]
    pub agent: String,

    /// Override the agent binary
    #[arg(long)]
    pub agent_command: Option<String>,

    /// Agent model override
    #[arg(long)]
    pub model: Option<String>,

    /// Tracker plugin supplying tasks
    #[arg(long, default_value = "json-prd")]
    pub tracker: String,

    /// Restrict to children of this epic
    #[arg(long)]
    pub epic: Option<String>,

    /// Path to the PRD or checklist file
    #[arg(long)]
    pub prd: Option<PathBuf>,

    /// Maximum iterations; 0 means unlimited
    #[arg(long, default_value_t = 0)]
    pub iterations: u32,

    /// Delay between iterations, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub delay: u64,

    /// Per-iteration timeout in seconds; 0 disables it
    #[arg(long, default_value_t = 1800)]
    pub timeout: u64,

    /// What to do when an iteration fails
    #[arg(long, value_parser = ["skip", "retry", "abort"], default_value = "skip")]
    pub on_error: String,

    /// Retry attempts per task when --on-error retry
    #[arg(long, default_value_t = 2)]
    pub max_retries: u32,

    /// Backoff base between retries, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub retry_delay: u64,

    /// Treat a non-zero agent exit as a usable iteration
    #[arg(long)]
    pub continue_on_error: bool,

    /// Skip the auto-commit after completed tasks
    #[arg(long)]
    pub no_commit: bool,

    /// Override a live (non-stale) session lock
    #[arg(long)]
    pub force: bool,

    /// Resume persisted state when present
    #[arg(long)]
    pub resume: bool,

    /// Suppress interactive event output
    #[arg(long)]
    pub headless: bool,

    /// Extra env exclude patterns (repeatable)
    #[arg(long = "env-exclude")]
    pub env_excludes: Vec<String>,

    /// Env passthrough patterns (repeatable)
    #[arg(long = "env-passthrough")]
    pub env_passthrough: Vec<String>,

    /// Run tasks in parallel worktrees with this many workers; 0 = single
    #[arg(long, default_value_t = 0)]
    pub workers: usize,

    /// Conflict handling for parallel merges
    #[arg(
        long,
        value_parser = ["manual", "ai-resolve", "abort-task", "rollback-session"],
        default_value = "manual"
    )]
    pub on_conflict: String,
}

#[derive(Debug, Args)]
pub struct ResumeArgs {
    /// Override a live (non-stale) session lock
    #[arg(long)]
    pub force: bool,

    /// Suppress interactive event output
    #[arg(long)]
    pub headless: bool,
}

fn build_config(cwd: PathBuf, args: &RunArgs) -> RunConfig {
    let mut config = RunConfig::new(cwd);
    config.agent = args.agent.clone();
    config.agent_config = AgentConfig {
        command: args.agent_command.clone(),
        model: args.model.clone(),
        extra_args: Vec::new(),
    };
    config.tracker = args.tracker.clone();
    config.epic_id = args.epic.clone();
    config.prd_path = args.prd.clone();
    config.max_iterations = args.iterations;
    config.iteration_delay = Duration::from_millis(args.delay);
    config.iteration_timeout = (args.timeout > 0).then(|| Duration::from_secs(args.timeout));
    config.error_strategy = match args.on_error.as_str() {
        "retry" => ErrorStrategy::Retry {
            max_retries: args.max_retries,
            delay_ms: args.retry_delay,
        },
        "abort" => ErrorStrategy::Abort,
        _ => ErrorStrategy::Skip,
    };
    config.continue_on_non_zero_exit = args.continue_on_error;
    config.auto_commit = !args.no_commit;
    config.env_excludes = args.env_excludes.clone();
    config.env_passthrough = args.env_passthrough.clone();
    config.force_lock = args.force;
    config.resume = args.resume;
    config.user_config_dir = Some(config::config_dir());
    config
}

pub async fn run(cwd: PathBuf, args: RunArgs) -> Result<()> {
    let config = build_config(cwd, &args);
    if args.workers > 0 {
        run_parallel(config, &args).await
    } else {
        run_single(config, args.headless).await
    }
}

pub async fn resume(cwd: PathBuf, args: ResumeArgs) -> Result<()> {
    let saved = state::load(&cwd)
        .filter(|s| s.is_resumable())
        .with_context(|| format!("no resumable session in {}", cwd.display()))?;

    let mut config = RunConfig::new(cwd);
    config.agent = saved.agent_plugin.clone();
    config.agent_config.model = saved.model.clone();
    config.tracker = saved.tracker_plugin.clone();
    config.epic_id = saved.epic_id.clone();
    config.prd_path = saved.prd_path.clone();
    config.max_iterations = saved.max_iterations;
    config.force_lock = args.force;
    config.resume = true;
    config.user_config_dir = Some(config::config_dir());

    println!(
        "resuming session {} at iteration {}",
        saved.session_id, saved.current_iteration
    );
    run_single(config, args.headless).await
}

async fn run_single(config: RunConfig, headless: bool) -> Result<()> {
    let agents = AgentRegistry::builtin();
    let trackers = TrackerRegistry::builtin();
    let mut engine = Engine::new(config, &agents, &trackers)?;

    let quiet = headless || config::is_daemon_child();
    if !quiet {
        engine.subscribe(print_engine_event);
    }

    // Ctrl-C requests a cooperative stop; the current iteration finishes.
    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupt received, finishing the current iteration…");
            cancel.cancel();
        }
    });

    let outcome = engine.run().await?;
    if !quiet {
        println!(
            "done: {:?} after {} iteration(s), {} task(s) completed",
            outcome.reason, outcome.iterations_run, outcome.tasks_completed
        );
    }
    if outcome.reason == StopReason::Cancelled {
        println!("session saved; continue with `ralph resume`");
    }
    Ok(())
}

async fn run_parallel(config: RunConfig, args: &RunArgs) -> Result<()> {
    let agents = Arc::new(AgentRegistry::builtin());
    let trackers = Arc::new(TrackerRegistry::builtin());

    // The parallel executor needs the task set up front.
    let tracker = trackers.create(
        &config.tracker,
        &TrackerConfig {
            cwd: config.cwd.clone(),
            epic_id: config.epic_id.clone(),
            prd_path: config.prd_path.clone(),
        },
    )?;
    let filter = TaskFilter {
        statuses: vec![TaskStatus::Open],
        labels: Vec::new(),
        epic_id: config.epic_id.clone(),
    };
    let tasks = tracker.get_tasks(Some(&filter)).await?;
    if tasks.is_empty() {
        println!("no open tasks; nothing to do");
        return Ok(());
    }

    let conflict_mode = match args.on_conflict.as_str() {
        "ai-resolve" => ConflictMode::AiResolve,
        "abort-task" => ConflictMode::AbortTask,
        "rollback-session" => ConflictMode::RollbackSession,
        _ => ConflictMode::Manual,
    };
    let parallel_config = ParallelConfig {
        max_workers: args.workers,
        conflict_mode,
        worktree: WorktreeConfig::default(),
    };

    let mut executor = ParallelExecutor::new(config, parallel_config, agents, trackers)?;
    if !args.headless {
        executor.subscribe(print_parallel_event);
    }

    let cancel = executor.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupt received, draining workers…");
            cancel.cancel();
        }
    });

    let outcome = executor.run(tasks).await?;
    println!(
        "parallel run finished: {} worker(s), {} merged, {} conflict(s), {} failed",
        outcome.workers_run, outcome.tasks_merged, outcome.conflicts, outcome.failed_workers
    );
    if outcome.rolled_back {
        bail!("session rolled back after a merge conflict");
    }
    if outcome.conflicts > 0 {
        println!("conflicted branches were kept for manual resolution");
    }
    Ok(())
}

fn print_engine_event(event: &EngineEvent) {
    match event {
        EngineEvent::Started { session_id } => println!("session {session_id} started"),
        EngineEvent::IterationStarted { iteration, task_id } => {
            println!("▸ iteration {iteration}: working on {task_id}");
        }
        EngineEvent::IterationCompleted {
            iteration,
            task_id,
            task_completed,
        } => {
            if *task_completed {
                println!("✓ iteration {iteration}: {task_id} completed");
            } else {
                println!("· iteration {iteration}: {task_id} still in progress");
            }
        }
        EngineEvent::IterationFailed {
            iteration,
            task_id,
            error,
        } => {
            println!("✗ iteration {iteration}: {task_id} failed: {error}");
        }
        EngineEvent::AllComplete => println!("all tasks complete"),
        EngineEvent::Stopped { reason } => println!("engine stopped ({reason:?})"),
        EngineEvent::SubagentSpawned {
            node_id,
            agent_type,
            depth,
        } => {
            let indent = "  ".repeat(*depth as usize + 1);
            println!("{indent}↳ subagent {node_id} ({agent_type})");
        }
        EngineEvent::SubagentFinished { node_id, status } => {
            println!("  ↲ subagent {node_id} {status:?}");
        }
    }
}

fn print_parallel_event(event: &ParallelEvent) {
    match event {
        ParallelEvent::WorkerStarted { worker_id, task_id } => {
            println!("▸ worker {worker_id}: {task_id}");
        }
        ParallelEvent::WorkerCompleted { worker_id, task_id } => {
            println!("✓ worker {worker_id}: {task_id}");
        }
        ParallelEvent::WorkerFailed {
            worker_id,
            task_id,
            error,
        } => {
            println!("✗ worker {worker_id}: {task_id}: {error}");
        }
        ParallelEvent::Merge(merge_event) => println!("merge: {merge_event:?}"),
    }
}
