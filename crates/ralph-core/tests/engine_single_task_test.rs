//! End-to-end tests for the single-agent execution engine.
//!
//! Each test builds a temporary git repository with a JSON PRD, points the
//! `test` agent at a scripted fake, and drives the engine through real
//! subprocesses, real git, and real persistence.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ralph_core::agent::AgentConfig;
use ralph_core::agent::AgentRegistry;
use ralph_core::engine::{EngineError, EngineEvent, StopReason};
use ralph_core::git::run_git;
use ralph_core::session::lock;
use ralph_core::session::state::{self, SessionStatus};
use ralph_core::tracker::TrackerRegistry;
use ralph_core::{Engine, ErrorStrategy, RunConfig};
use ralph_test_utils::{create_temp_repo, write_script};

fn write_prd(repo: &Path, tasks: serde_json::Value) -> PathBuf {
    let path = repo.join("prd.json");
    let doc = serde_json::json!({
        "name": "test-project",
        "description": "A test project.",
        "tasks": tasks,
    });
    std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    path
}

fn config_for(repo: &Path, script: &Path, prd: &Path) -> RunConfig {
    let mut config = RunConfig::new(repo);
    config.agent = "test".to_string();
    config.agent_config = AgentConfig {
        command: Some(script.to_str().unwrap().to_string()),
        ..Default::default()
    };
    config.tracker = "json-prd".to_string();
    config.prd_path = Some(prd.to_path_buf());
    config.max_iterations = 5;
    config.iteration_timeout = Some(Duration::from_secs(30));
    config
}

fn collect_events(engine: &mut Engine) -> Arc<Mutex<Vec<EngineEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

#[tokio::test]
async fn single_task_happy_path() {
    let (_dir, repo) = create_temp_repo();
    let prd = write_prd(
        &repo,
        serde_json::json!([
            {"id": "T1", "title": "Add hello", "status": "open", "priority": 2},
        ]),
    );
    let script = write_script(
        &repo,
        "agent.sh",
        "PROMPT=$(cat)\n\
         case \"$PROMPT\" in *'single word: ready'*) echo ready; exit 0 ;; esac\n\
         echo 'hello world' > hello.txt\n\
         echo 'hello world'\n\
         echo '<promise>COMPLETE</promise>'\n",
    );

    let agents = AgentRegistry::builtin();
    let trackers = TrackerRegistry::builtin();
    let mut engine = Engine::new(config_for(&repo, &script, &prd), &agents, &trackers).unwrap();
    let events = collect_events(&mut engine);

    let outcome = engine.run().await.unwrap();
    assert_eq!(outcome.reason, StopReason::AllComplete);
    assert_eq!(outcome.iterations_run, 1);
    assert_eq!(outcome.tasks_completed, 1);

    // The agent's work was auto-committed with the task message.
    assert!(repo.join("hello.txt").exists());
    let subject = run_git(&repo, &["log", "-1", "--pretty=%s"]).unwrap();
    assert_eq!(subject.trimmed(), "feat: T1 - Add hello");

    // The tracker recorded the completion.
    let prd_contents = std::fs::read_to_string(&prd).unwrap();
    assert!(prd_contents.contains("completed"));

    // Session state is gone on success; the lock is released.
    assert!(state::load(&repo).is_none());
    assert!(lock::read_lock(&repo).is_none());

    // Progress log recorded the iteration.
    let progress = std::fs::read_to_string(repo.join(".ralph-tui/progress.md")).unwrap();
    assert!(progress.contains("## ✓ Iteration 1 — T1: Add hello"));
    assert!(progress.contains("hello world"));

    // Event ordering: started → iteration → all complete → stopped.
    let events = events.lock().unwrap();
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| match e {
            EngineEvent::Started { .. } => "started",
            EngineEvent::IterationStarted { .. } => "iteration_started",
            EngineEvent::IterationCompleted { .. } => "iteration_completed",
            EngineEvent::AllComplete => "all_complete",
            EngineEvent::Stopped { .. } => "stopped",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "started",
            "iteration_started",
            "iteration_completed",
            "all_complete",
            "stopped"
        ]
    );
    assert!(matches!(
        events.last().unwrap(),
        EngineEvent::Stopped {
            reason: StopReason::AllComplete
        }
    ));
}

#[tokio::test]
async fn task_without_marker_stays_in_progress_across_iterations() {
    let (_dir, repo) = create_temp_repo();
    let prd = write_prd(
        &repo,
        serde_json::json!([
            {"id": "T1", "title": "Long task", "status": "open", "priority": 1},
        ]),
    );
    // No completion marker: multi-turn work.
    let script = write_script(&repo, "agent.sh", "cat > /dev/null\necho 'still going'\n");

    let agents = AgentRegistry::builtin();
    let trackers = TrackerRegistry::builtin();
    let mut config = config_for(&repo, &script, &prd);
    config.max_iterations = 2;

    let mut engine = Engine::new(config, &agents, &trackers).unwrap();
    let outcome = engine.run().await.unwrap();

    assert_eq!(outcome.reason, StopReason::MaxIterations);
    assert_eq!(outcome.iterations_run, 2);
    assert_eq!(outcome.tasks_completed, 0);

    // The session is paused and resumable; both iterations hit T1.
    let saved = state::load(&repo).unwrap();
    assert_eq!(saved.status, SessionStatus::Paused);
    assert_eq!(saved.current_iteration, 2);
    assert_eq!(saved.iteration_history.len(), 2);
    assert!(saved.iteration_history.iter().all(|h| h.task_id == "T1"));
    assert!(saved.is_resumable());
}

#[tokio::test]
async fn resume_skips_completed_tasks_and_continues_numbering() {
    let (_dir, repo) = create_temp_repo();
    let prd = write_prd(
        &repo,
        serde_json::json!([
            {"id": "T1", "title": "First", "status": "open", "priority": 1},
            {"id": "T2", "title": "Second", "status": "open", "priority": 2},
        ]),
    );
    let script = write_script(
        &repo,
        "agent.sh",
        "cat > /dev/null\necho '<promise>COMPLETE</promise>'\n",
    );

    let agents = AgentRegistry::builtin();
    let trackers = TrackerRegistry::builtin();

    // First run: exactly one iteration, then stop as if interrupted.
    let mut config = config_for(&repo, &script, &prd);
    config.max_iterations = 1;
    let mut engine = Engine::new(config, &agents, &trackers).unwrap();
    let first = engine.run().await.unwrap();
    assert_eq!(first.reason, StopReason::MaxIterations);
    assert_eq!(first.tasks_completed, 1);
    drop(engine);

    let saved = state::load(&repo).unwrap();
    assert!(saved.is_resumable());
    let session_id = saved.session_id.clone();

    // Second run resumes: T1 is skipped, T2 completes, numbering continues.
    let mut config = config_for(&repo, &script, &prd);
    config.resume = true;
    config.max_iterations = 5;
    let mut engine = Engine::new(config, &agents, &trackers).unwrap();
    let events = collect_events(&mut engine);
    let second = engine.run().await.unwrap();

    assert_eq!(second.reason, StopReason::AllComplete);
    assert_eq!(second.session_id, session_id, "resume keeps the session id");
    assert_eq!(second.iterations_run, 1);
    assert_eq!(second.tasks_completed, 2);

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::IterationStarted { iteration: 2, task_id } if task_id == "T2"
    )));
    assert!(state::load(&repo).is_none());
}

#[tokio::test]
async fn interrupted_session_saves_state_and_releases_lock() {
    let (_dir, repo) = create_temp_repo();
    let prd = write_prd(
        &repo,
        serde_json::json!([
            {"id": "T1", "title": "Slowish", "status": "open", "priority": 1},
        ]),
    );
    // Slow enough that stop() lands mid-iteration.
    let script = write_script(
        &repo,
        "agent.sh",
        "PROMPT=$(cat)\n\
         case \"$PROMPT\" in *'single word: ready'*) echo ready; exit 0 ;; esac\n\
         sleep 2\necho 'no marker'\n",
    );

    let agents = AgentRegistry::builtin();
    let trackers = TrackerRegistry::builtin();
    let mut engine =
        Engine::new(config_for(&repo, &script, &prd), &agents, &trackers).unwrap();

    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
    });

    let outcome = engine.run().await.unwrap();
    assert_eq!(outcome.reason, StopReason::Cancelled);
    // The in-flight iteration ran to completion before stopping.
    assert_eq!(outcome.iterations_run, 1);

    let saved = state::load(&repo).unwrap();
    assert_eq!(saved.status, SessionStatus::Interrupted);
    assert!(saved.is_resumable());
    assert!(lock::read_lock(&repo).is_none(), "lock released on exit");
}

#[tokio::test]
async fn stale_lock_is_replaced_without_force() {
    let (_dir, repo) = create_temp_repo();
    let prd = write_prd(
        &repo,
        serde_json::json!([
            {"id": "T1", "title": "Quick", "status": "open", "priority": 1},
        ]),
    );
    let script = write_script(
        &repo,
        "agent.sh",
        "cat > /dev/null\necho '<promise>COMPLETE</promise>'\n",
    );

    // A lock from a dead pid, two hours old.
    std::fs::create_dir_all(repo.join(".ralph-tui")).unwrap();
    let stale = serde_json::json!({
        "session_id": "ghost",
        "pid": 9_999_999u32,
        "cwd": repo,
        "acquired_at": chrono::Utc::now() - chrono::Duration::hours(2),
        "hostname": "elsewhere",
    });
    std::fs::write(
        repo.join(".ralph-tui/session.lock"),
        serde_json::to_string_pretty(&stale).unwrap(),
    )
    .unwrap();

    let agents = AgentRegistry::builtin();
    let trackers = TrackerRegistry::builtin();
    let mut engine =
        Engine::new(config_for(&repo, &script, &prd), &agents, &trackers).unwrap();

    let outcome = engine.run().await.unwrap();
    assert_eq!(outcome.reason, StopReason::AllComplete);
}

#[tokio::test]
async fn live_lock_conflict_fails_without_force() {
    let (_dir, repo) = create_temp_repo();
    let prd = write_prd(
        &repo,
        serde_json::json!([
            {"id": "T1", "title": "Blocked", "status": "open", "priority": 1},
        ]),
    );
    let script = write_script(&repo, "agent.sh", "cat > /dev/null\necho ok\n");

    let _held = lock::acquire(&repo, "other-session", false).unwrap();

    let agents = AgentRegistry::builtin();
    let trackers = TrackerRegistry::builtin();
    let mut engine =
        Engine::new(config_for(&repo, &script, &prd), &agents, &trackers).unwrap();

    let err = engine.run().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Lock(lock::LockError::Held { .. })
    ));
}

#[tokio::test]
async fn empty_task_list_completes_immediately() {
    let (_dir, repo) = create_temp_repo();
    let prd = write_prd(&repo, serde_json::json!([]));
    let script = write_script(&repo, "agent.sh", "cat > /dev/null\necho ready\n");

    let agents = AgentRegistry::builtin();
    let trackers = TrackerRegistry::builtin();
    let mut engine =
        Engine::new(config_for(&repo, &script, &prd), &agents, &trackers).unwrap();
    let events = collect_events(&mut engine);

    let outcome = engine.run().await.unwrap();
    assert_eq!(outcome.reason, StopReason::AllComplete);
    assert_eq!(outcome.iterations_run, 0);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, EngineEvent::AllComplete)));
}

#[tokio::test]
async fn abort_strategy_stops_the_engine_on_failure() {
    let (_dir, repo) = create_temp_repo();
    let prd = write_prd(
        &repo,
        serde_json::json!([
            {"id": "T1", "title": "Doomed", "status": "open", "priority": 1},
        ]),
    );
    // Succeeds for the preflight probe, fails for real iterations.
    let script = write_script(
        &repo,
        "agent.sh",
        "PROMPT=$(cat)\n\
         case \"$PROMPT\" in *'single word: ready'*) echo ready; exit 0 ;; esac\n\
         echo boom\nexit 3\n",
    );

    let agents = AgentRegistry::builtin();
    let trackers = TrackerRegistry::builtin();
    let mut config = config_for(&repo, &script, &prd);
    config.error_strategy = ErrorStrategy::Abort;

    let mut engine = Engine::new(config, &agents, &trackers).unwrap();
    let err = engine.run().await.unwrap_err();
    assert!(matches!(err, EngineError::Aborted(_)));

    let saved = state::load(&repo).unwrap();
    assert_eq!(saved.status, SessionStatus::Failed);
}

#[tokio::test]
async fn skip_strategy_moves_past_a_failing_task() {
    let (_dir, repo) = create_temp_repo();
    let prd = write_prd(
        &repo,
        serde_json::json!([
            {"id": "BAD", "title": "Fails", "status": "open", "priority": 1},
            {"id": "GOOD", "title": "Works", "status": "open", "priority": 2},
        ]),
    );
    // Fail for the BAD task, succeed (with marker) for GOOD.
    let script = write_script(
        &repo,
        "agent.sh",
        "PROMPT=$(cat)\n\
         case \"$PROMPT\" in\n\
         *\"Task BAD\"*) echo 'cannot do it'; exit 1 ;;\n\
         *) echo '<promise>COMPLETE</promise>' ;;\n\
         esac\n",
    );

    let agents = AgentRegistry::builtin();
    let trackers = TrackerRegistry::builtin();
    let mut config = config_for(&repo, &script, &prd);
    config.error_strategy = ErrorStrategy::Skip;

    let mut engine = Engine::new(config, &agents, &trackers).unwrap();
    let events = collect_events(&mut engine);

    let outcome = engine.run().await.unwrap();
    assert_eq!(outcome.reason, StopReason::AllComplete);
    assert_eq!(outcome.iterations_run, 2);
    assert_eq!(outcome.tasks_completed, 1);

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::IterationFailed { task_id, .. } if task_id == "BAD"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::IterationCompleted { task_id, task_completed: true, .. } if task_id == "GOOD"
    )));
}

#[tokio::test]
async fn retry_strategy_reattempts_before_giving_up() {
    let (_dir, repo) = create_temp_repo();
    let prd = write_prd(
        &repo,
        serde_json::json!([
            {"id": "FLAKY", "title": "Fails twice", "status": "open", "priority": 1},
        ]),
    );
    // Fails until its attempt counter reaches three, then succeeds.
    let script = write_script(
        &repo,
        "agent.sh",
        "PROMPT=$(cat)\n\
         case \"$PROMPT\" in *'single word: ready'*) echo ready; exit 0 ;; esac\n\
         echo try >> .attempts\n\
         if [ \"$(wc -l < .attempts)\" -lt 3 ]; then echo 'flaky'; exit 1; fi\n\
         echo '<promise>COMPLETE</promise>'\n",
    );

    let agents = AgentRegistry::builtin();
    let trackers = TrackerRegistry::builtin();
    let mut config = config_for(&repo, &script, &prd);
    config.error_strategy = ErrorStrategy::Retry {
        max_retries: 3,
        delay_ms: 10,
    };
    config.max_iterations = 10;

    let mut engine = Engine::new(config, &agents, &trackers).unwrap();
    let outcome = engine.run().await.unwrap();

    assert_eq!(outcome.reason, StopReason::AllComplete);
    assert_eq!(outcome.tasks_completed, 1);
    assert!(outcome.iterations_run >= 3, "took {}", outcome.iterations_run);
}

#[tokio::test]
async fn preflight_failure_is_fatal_with_suggestion() {
    let (_dir, repo) = create_temp_repo();
    let prd = write_prd(
        &repo,
        serde_json::json!([
            {"id": "T1", "title": "Never runs", "status": "open", "priority": 1},
        ]),
    );

    let agents = AgentRegistry::builtin();
    let trackers = TrackerRegistry::builtin();
    let mut config = RunConfig::new(&repo);
    config.agent = "test".to_string();
    config.agent_config.command = Some("/nonexistent/agent".to_string());
    config.tracker = "json-prd".to_string();
    config.prd_path = Some(prd);

    let mut engine = Engine::new(config, &agents, &trackers).unwrap();
    let err = engine.run().await.unwrap_err();
    match err {
        EngineError::Preflight { error, .. } => {
            assert!(!error.is_empty());
        }
        other => panic!("expected preflight failure, got {other:?}"),
    }

    // Nothing was persisted and no lock is held.
    assert!(state::load(&repo).is_none());
    assert!(lock::read_lock(&repo).is_none());
}
