//! End-to-end tests for the parallel executor and merge queue.
//!
//! Workers use the markdown tracker (read-only completion) so the only
//! file mutations are the scripted agent's, which keeps merge outcomes
//! deterministic per test.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ralph_core::agent::{AgentConfig, AgentRegistry};
use ralph_core::git::{git_succeeds, run_git};
use ralph_core::merge::{MergeEvent, MergeStatus};
use ralph_core::parallel::{
    ConflictMode, ParallelConfig, ParallelEvent, ParallelExecutor,
};
use ralph_core::tracker::{Task, TrackerRegistry};
use ralph_core::worktree::WorktreeConfig;
use ralph_core::RunConfig;
use ralph_test_utils::{create_temp_repo, run_git as git, write_script};

/// A repo with a committed checklist and a conflict-bait file.
fn setup_repo() -> (tempfile::TempDir, std::path::PathBuf) {
    let (dir, repo) = create_temp_repo();
    std::fs::write(repo.join("file.txt"), "base\n").unwrap();
    std::fs::write(
        repo.join("TASKS.md"),
        "# Tasks\n\n- [ ] A: Change the file\n- [ ] B: Change it differently\n",
    )
    .unwrap();
    // Pre-seed the ignore entry so gitignore maintenance is a no-op and the
    // main tree stays clean throughout.
    std::fs::write(
        repo.join(".gitignore"),
        "# ralph worktrees and session metadata\n.ralph-tui/\n",
    )
    .unwrap();
    git(&repo, &["add", "-A"]);
    git(&repo, &["commit", "-m", "seed tasks"]);
    (dir, repo)
}

/// Agent that edits per task id, then signals completion.
fn write_worker_agent(repo: &Path, body_a: &str, body_b: &str) -> std::path::PathBuf {
    write_script(
        repo,
        "agent.sh",
        &format!(
            "PROMPT=$(cat)\n\
             case \"$PROMPT\" in\n\
             *'single word: ready'*) echo ready; exit 0 ;;\n\
             *'Task A'*) {body_a} ;;\n\
             *'Task B'*) {body_b} ;;\n\
             esac\n\
             echo '<promise>COMPLETE</promise>'\n"
        ),
    )
}

fn config_for(repo: &Path, script: &Path) -> RunConfig {
    let mut config = RunConfig::new(repo);
    config.agent = "test".to_string();
    config.agent_config = AgentConfig {
        command: Some(script.to_str().unwrap().to_string()),
        ..Default::default()
    };
    config.tracker = "markdown".to_string();
    config.prd_path = Some(repo.join("TASKS.md"));
    config.iteration_timeout = Some(Duration::from_secs(30));
    config.session_id = Some("par-test".to_string());
    config
}

fn tasks() -> Vec<Task> {
    vec![
        Task::new("A", "Change the file"),
        Task::new("B", "Change it differently"),
    ]
}

fn executor(repo: &Path, script: &Path, mode: ConflictMode) -> ParallelExecutor {
    let parallel_config = ParallelConfig {
        max_workers: 2,
        conflict_mode: mode,
        worktree: WorktreeConfig::default(),
    };
    ParallelExecutor::new(
        config_for(repo, script),
        parallel_config,
        Arc::new(AgentRegistry::builtin()),
        Arc::new(TrackerRegistry::builtin()),
    )
    .unwrap()
}

#[tokio::test]
async fn independent_tasks_merge_cleanly() {
    let (_dir, repo) = setup_repo();
    let script = write_worker_agent(
        &repo,
        "echo 'from A' > a.txt",
        "echo 'from B' > b.txt",
    );

    let mut executor = executor(&repo, &script, ConflictMode::Manual);
    let outcome = executor.run(tasks()).await.unwrap();

    assert_eq!(outcome.workers_run, 2);
    assert_eq!(outcome.tasks_merged, 2);
    assert_eq!(outcome.conflicts, 0);
    assert_eq!(outcome.failed_workers, 0);

    // Both results landed in the main workspace.
    assert!(repo.join("a.txt").exists());
    assert!(repo.join("b.txt").exists());

    // The main tree is clean afterwards.
    let status = run_git(&repo, &["status", "--porcelain"]).unwrap();
    assert!(status.stdout.trim().is_empty());
}

#[tokio::test]
async fn conflicting_workers_abort_second_merge_and_keep_branch() {
    let (_dir, repo) = setup_repo();
    // Both tasks rewrite the same file: the second merge must conflict.
    let script = write_worker_agent(
        &repo,
        "echo 'change from A' > file.txt",
        "echo 'change from B' > file.txt",
    );

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);

    let mut executor = executor(&repo, &script, ConflictMode::Manual);
    executor.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

    let outcome = executor.run(tasks()).await.unwrap();
    assert_eq!(outcome.workers_run, 2);
    assert_eq!(outcome.tasks_merged, 1);
    assert_eq!(outcome.conflicts, 1);

    // HEAD holds exactly one worker's change; the tree is clean.
    let contents = std::fs::read_to_string(repo.join("file.txt")).unwrap();
    assert!(
        contents == "change from A\n" || contents == "change from B\n",
        "unexpected contents: {contents:?}"
    );
    let status = run_git(&repo, &["status", "--porcelain"]).unwrap();
    assert!(status.stdout.trim().is_empty());

    // The conflicted branch is retained for manual resolution.
    let ops = executor.merge_operations();
    let conflicted = ops
        .iter()
        .find(|op| op.status == MergeStatus::Conflicted)
        .expect("one operation should be conflicted");
    assert!(git_succeeds(
        &repo,
        &[
            "rev-parse",
            "--verify",
            &format!("refs/heads/{}", conflicted.source_branch)
        ],
    )
    .unwrap());
    assert_eq!(
        conflicted.conflicted_files.as_deref(),
        Some(&["file.txt".to_string()][..])
    );

    // conflict:detected reached the event bus.
    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        ParallelEvent::Merge(MergeEvent::ConflictDetected { .. })
    )));
    // Both merge attempts produced terminal merge events.
    let completed = events
        .iter()
        .filter(|e| matches!(e, ParallelEvent::Merge(MergeEvent::Completed { .. })))
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn rollback_session_mode_unwinds_merged_work() {
    let (_dir, repo) = setup_repo();
    let start_head = run_git(&repo, &["rev-parse", "HEAD"]).unwrap().trimmed().to_string();

    let script = write_worker_agent(
        &repo,
        "echo 'change from A' > file.txt",
        "echo 'change from B' > file.txt",
    );

    let mut executor = executor(&repo, &script, ConflictMode::RollbackSession);
    let outcome = executor.run(tasks()).await.unwrap();

    assert!(outcome.rolled_back);
    assert_eq!(outcome.tasks_merged, 0);

    // HEAD is back at the session-start tag.
    let head = run_git(&repo, &["rev-parse", "HEAD"]).unwrap().trimmed().to_string();
    assert_eq!(head, start_head);
    assert_eq!(
        std::fs::read_to_string(repo.join("file.txt")).unwrap(),
        "base\n"
    );
}

#[tokio::test]
async fn failing_worker_does_not_block_the_queue() {
    let (_dir, repo) = setup_repo();
    // A fails hard; B succeeds.
    let script = write_worker_agent(
        &repo,
        "echo 'broken'; exit 1",
        "echo 'from B' > b.txt",
    );

    let mut executor = executor(&repo, &script, ConflictMode::Manual);
    let outcome = executor.run(tasks()).await.unwrap();

    assert_eq!(outcome.workers_run, 2);
    assert_eq!(outcome.failed_workers, 1);
    assert_eq!(outcome.tasks_merged, 1);
    assert!(repo.join("b.txt").exists());
}

#[tokio::test]
async fn workers_never_touch_the_main_working_tree() {
    let (_dir, repo) = setup_repo();
    let script = write_worker_agent(
        &repo,
        "echo 'from A' > a.txt",
        "echo 'from B' > b.txt",
    );

    // Watch the main tree for dirt while workers run: completed merges move
    // HEAD, but the working tree must always match it.
    let mut executor = executor(&repo, &script, ConflictMode::Manual);
    executor.run(tasks()).await.unwrap();

    let status = run_git(&repo, &["status", "--porcelain"]).unwrap();
    assert!(
        status.stdout.trim().is_empty(),
        "main working tree dirty: {}",
        status.stdout
    );

    // Worktrees lived under the metadata dir, which is gitignored.
    let gitignore = std::fs::read_to_string(repo.join(".gitignore")).unwrap();
    assert!(gitignore.contains(".ralph-tui/"));
}
