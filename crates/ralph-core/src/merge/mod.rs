//! Sequential merge engine for parallel worker branches.
//!
//! Completed worker branches are merged back into the main workspace one at
//! a time, in arrival order. Every operation tags HEAD before touching the
//! index, tries fast-forward first, falls back to a merge commit, and on
//! conflict aborts and hard-resets to the backup tag, so HEAD always lands
//! on a committed state.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::git::{self, GitError};
use crate::parallel::WorkerResult;
use crate::worktree::sanitize_task_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Conflicted,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    FastForward,
    MergeCommit,
}

/// One queued merge of a worker branch.
#[derive(Debug, Clone)]
pub struct MergeOperation {
    pub id: Uuid,
    pub worker_result: WorkerResult,
    pub status: MergeStatus,
    pub backup_tag: Option<String>,
    pub source_branch: String,
    pub commit_message: String,
    pub strategy: Option<MergeStrategy>,
    pub merge_commit: Option<String>,
    pub files_changed: Vec<String>,
    pub conflicted_files: Option<Vec<String>>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeEvent {
    Queued { op_id: Uuid, branch: String },
    Started { op_id: Uuid },
    Completed { op_id: Uuid, strategy: MergeStrategy },
    Failed { op_id: Uuid, error: String },
    RolledBack { op_id: Uuid },
    ConflictDetected { op_id: Uuid, files: Vec<String> },
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("unknown merge operation {0}")]
    UnknownOp(Uuid),

    #[error("operation {0} has no backup tag")]
    NoBackupTag(Uuid),

    #[error("no session backup tag exists")]
    NoSessionTag,
}

type MergeListener = Box<dyn Fn(&MergeEvent) + Send + Sync>;

/// FIFO queue of merge operations with a single sequential consumer.
pub struct MergeEngine {
    repo: PathBuf,
    session_id: String,
    session_tag: Option<String>,
    queue: VecDeque<Uuid>,
    ops: HashMap<Uuid, MergeOperation>,
    order: Vec<Uuid>,
    processing: bool,
    listeners: Vec<MergeListener>,
}

impl MergeEngine {
    pub fn new(repo: impl Into<PathBuf>, session_id: &str) -> Result<Self, MergeError> {
        let repo = repo.into();
        git::ensure_repo(&repo)?;
        Ok(Self {
            repo,
            session_id: session_id.to_string(),
            session_tag: None,
            queue: VecDeque::new(),
            ops: HashMap::new(),
            order: Vec::new(),
            processing: false,
            listeners: Vec::new(),
        })
    }

    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: Fn(&MergeEvent) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Tag current HEAD as the session-start point for whole-session
    /// rollback. Idempotent: an existing tag is reused.
    pub fn create_session_backup(&mut self) -> Result<String, MergeError> {
        let tag = format!("ralph/session-start/{}", sanitize_task_id(&self.session_id));
        git::validate_ref_name(&tag)?;

        if !git::git_succeeds(&self.repo, &["rev-parse", "--verify", &format!("refs/tags/{tag}")])? {
            git::run_git(&self.repo, &["tag", &tag])?;
        }

        self.session_tag = Some(tag.clone());
        Ok(tag)
    }

    /// Queue a completed worker branch for merging. Arrival order is
    /// preserved regardless of worker completion order.
    pub fn enqueue(&mut self, worker_result: WorkerResult) -> Uuid {
        let id = Uuid::new_v4();
        let source_branch = worker_result.branch_name.clone();
        let commit_message = format!(
            "feat({}): {}",
            worker_result.task.id, worker_result.task.title
        );

        let op = MergeOperation {
            id,
            worker_result,
            status: MergeStatus::Queued,
            backup_tag: None,
            source_branch: source_branch.clone(),
            commit_message,
            strategy: None,
            merge_commit: None,
            files_changed: Vec::new(),
            conflicted_files: None,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        };

        self.ops.insert(id, op);
        self.order.push(id);
        self.queue.push_back(id);
        self.emit(&MergeEvent::Queued {
            op_id: id,
            branch: source_branch,
        });
        id
    }

    /// Process the next queued operation. A no-op while an operation is
    /// already in flight.
    pub fn process_next(&mut self) -> Result<Option<Uuid>, MergeError> {
        if self.processing {
            return Ok(None);
        }
        let Some(id) = self.queue.pop_front() else {
            return Ok(None);
        };

        self.processing = true;
        let outcome = self.execute(id);
        self.processing = false;
        outcome?;
        Ok(Some(id))
    }

    /// Drain the queue sequentially.
    pub fn process_all(&mut self) -> Result<Vec<Uuid>, MergeError> {
        let mut processed = Vec::new();
        while let Some(id) = self.process_next()? {
            processed.push(id);
        }
        Ok(processed)
    }

    /// Hard-reset to one operation's backup tag.
    pub fn rollback_merge(&mut self, op_id: Uuid) -> Result<(), MergeError> {
        let tag = {
            let op = self.ops.get(&op_id).ok_or(MergeError::UnknownOp(op_id))?;
            op.backup_tag.clone().ok_or(MergeError::NoBackupTag(op_id))?
        };

        git::run_git(&self.repo, &["reset", "--hard", &tag])?;

        let op = self.ops.get_mut(&op_id).expect("op existed above");
        op.status = MergeStatus::RolledBack;
        op.completed_at = Some(Utc::now());
        self.emit(&MergeEvent::RolledBack { op_id });
        Ok(())
    }

    /// Hard-reset to the session-start tag and mark every completed
    /// operation rolled back.
    pub fn rollback_session(&mut self) -> Result<(), MergeError> {
        let tag = self.session_tag.clone().ok_or(MergeError::NoSessionTag)?;
        git::run_git(&self.repo, &["reset", "--hard", &tag])?;

        let rolled_back: Vec<Uuid> = self
            .order
            .iter()
            .copied()
            .filter(|id| {
                self.ops
                    .get(id)
                    .is_some_and(|op| op.status == MergeStatus::Completed)
            })
            .collect();

        for op_id in rolled_back {
            if let Some(op) = self.ops.get_mut(&op_id) {
                op.status = MergeStatus::RolledBack;
                op.completed_at = Some(Utc::now());
            }
            self.emit(&MergeEvent::RolledBack { op_id });
        }
        Ok(())
    }

    pub fn get(&self, op_id: Uuid) -> Option<&MergeOperation> {
        self.ops.get(&op_id)
    }

    /// Operations in enqueue order.
    pub fn operations(&self) -> Vec<&MergeOperation> {
        self.order.iter().filter_map(|id| self.ops.get(id)).collect()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn execute(&mut self, op_id: Uuid) -> Result<(), MergeError> {
        let (branch, task_id, message) = {
            let op = self.ops.get_mut(&op_id).ok_or(MergeError::UnknownOp(op_id))?;
            op.status = MergeStatus::InProgress;
            op.started_at = Some(Utc::now());
            (
                op.source_branch.clone(),
                op.worker_result.task.id.clone(),
                op.commit_message.clone(),
            )
        };
        self.emit(&MergeEvent::Started { op_id });

        if let Err(e) = git::validate_ref_name(&branch) {
            return self.fail(op_id, format!("invalid source branch: {e}"));
        }

        // 1. The branch must be ahead of HEAD.
        let ahead = git::run_git(
            &self.repo,
            &["rev-list", "--count", &format!("HEAD..{branch}")],
        )?;
        if ahead.trimmed() == "0" {
            return self.fail(op_id, format!("branch {branch} has no commits ahead of HEAD"));
        }

        // 2. Backup tag before any index mutation.
        let backup_tag = format!(
            "ralph/pre-merge/{}/{}",
            sanitize_task_id(&task_id),
            Utc::now().timestamp_millis()
        );
        git::validate_ref_name(&backup_tag)?;
        git::run_git(&self.repo, &["tag", &backup_tag])?;
        if let Some(op) = self.ops.get_mut(&op_id) {
            op.backup_tag = Some(backup_tag.clone());
        }

        // 3. Fast-forward first.
        if git::run_git(&self.repo, &["merge", "--ff-only", &branch]).is_ok() {
            return self.complete(op_id, &backup_tag, MergeStrategy::FastForward);
        }

        // 4. Merge commit with an explicit message.
        match git::run_git(&self.repo, &["merge", "--no-ff", "-m", &message, &branch]) {
            Ok(_) => self.complete(op_id, &backup_tag, MergeStrategy::MergeCommit),
            Err(merge_err) => {
                // 5. Conflict detection via porcelain status.
                let conflicted = self.conflicted_files()?;
                if !conflicted.is_empty() {
                    let _ = git::run_git(&self.repo, &["merge", "--abort"]);
                    git::run_git(&self.repo, &["reset", "--hard", &backup_tag])?;

                    if let Some(op) = self.ops.get_mut(&op_id) {
                        op.status = MergeStatus::Conflicted;
                        op.conflicted_files = Some(conflicted.clone());
                        op.completed_at = Some(Utc::now());
                        op.error = Some(format!("merge of {branch} conflicted"));
                    }
                    tracing::warn!(
                        op_id = %op_id,
                        branch = %branch,
                        files = ?conflicted,
                        "merge conflict detected, aborted and rolled back"
                    );
                    self.emit(&MergeEvent::ConflictDetected {
                        op_id,
                        files: conflicted,
                    });
                    return Ok(());
                }

                // 6. Any other failure: roll back to the tag.
                git::run_git(&self.repo, &["reset", "--hard", &backup_tag])?;
                self.fail(op_id, format!("merge failed: {merge_err}"))
            }
        }
    }

    fn complete(
        &mut self,
        op_id: Uuid,
        backup_tag: &str,
        strategy: MergeStrategy,
    ) -> Result<(), MergeError> {
        let files = git::run_git(
            &self.repo,
            &["diff", "--name-only", backup_tag, "HEAD"],
        )?;
        let merge_commit = git::run_git(&self.repo, &["rev-parse", "--short", "HEAD"])?
            .trimmed()
            .to_string();

        if let Some(op) = self.ops.get_mut(&op_id) {
            op.status = MergeStatus::Completed;
            op.strategy = Some(strategy);
            op.merge_commit = Some(merge_commit);
            op.files_changed = files.stdout.lines().map(String::from).collect();
            op.completed_at = Some(Utc::now());
        }

        tracing::info!(op_id = %op_id, strategy = ?strategy, "merge completed");
        self.emit(&MergeEvent::Completed { op_id, strategy });
        Ok(())
    }

    fn fail(&mut self, op_id: Uuid, error: String) -> Result<(), MergeError> {
        if let Some(op) = self.ops.get_mut(&op_id) {
            op.status = MergeStatus::Failed;
            op.error = Some(error.clone());
            op.completed_at = Some(Utc::now());
        }
        tracing::warn!(op_id = %op_id, error = %error, "merge failed");
        self.emit(&MergeEvent::Failed { op_id, error });
        Ok(())
    }

    fn conflicted_files(&self) -> Result<Vec<String>, MergeError> {
        let status = git::run_git(&self.repo, &["status", "--porcelain"])?;
        let mut files = Vec::new();
        for line in status.stdout.lines() {
            if line.len() < 4 {
                continue;
            }
            let code = &line[..2];
            if matches!(code, "UU" | "AA" | "DD" | "AU" | "UA") {
                files.push(line[3..].to_string());
            }
        }
        Ok(files)
    }

    fn emit(&self, event: &MergeEvent) {
        for listener in &self.listeners {
            // Listener panics are swallowed; the queue must keep moving.
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(event)))
                .is_err()
            {
                tracing::warn!("merge event listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("repo", &self.repo)
            .field("session_id", &self.session_id)
            .field("queued", &self.queue.len())
            .field("ops", &self.order.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Task;
    use ralph_test_utils::{create_temp_repo, run_git};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    fn worker_result(task_id: &str, title: &str, branch: &str) -> WorkerResult {
        WorkerResult {
            worker_id: 0,
            task: Task::new(task_id, title),
            branch_name: branch.to_string(),
            worktree_id: format!("wt0-{task_id}"),
            success: true,
            iteration: None,
            error: None,
        }
    }

    /// Create `branch` off current HEAD with one commit touching `file`.
    fn branch_with_commit(repo: &Path, branch: &str, file: &str, content: &str) {
        run_git(repo, &["checkout", "-b", branch]);
        std::fs::write(repo.join(file), content).unwrap();
        run_git(repo, &["add", "-A"]);
        run_git(repo, &["commit", "-m", &format!("work on {file}")]);
        run_git(repo, &["checkout", "main"]);
    }

    fn head_of(repo: &Path) -> String {
        crate::git::head_sha(repo).unwrap()
    }

    #[test]
    fn fast_forward_merge_records_strategy_and_files() {
        let (_dir, repo) = create_temp_repo();
        branch_with_commit(&repo, "ralph-parallel/T1", "feature.txt", "f\n");

        let mut engine = MergeEngine::new(&repo, "sess").unwrap();
        engine.create_session_backup().unwrap();
        let op_id = engine.enqueue(worker_result("T1", "Feature", "ralph-parallel/T1"));
        engine.process_all().unwrap();

        let op = engine.get(op_id).unwrap();
        assert_eq!(op.status, MergeStatus::Completed);
        assert_eq!(op.strategy, Some(MergeStrategy::FastForward));
        assert!(op.files_changed.contains(&"feature.txt".to_string()));
        assert!(op.backup_tag.is_some());
        assert!(repo.join("feature.txt").exists());
    }

    #[test]
    fn diverged_branch_gets_a_merge_commit_with_task_message() {
        let (_dir, repo) = create_temp_repo();
        branch_with_commit(&repo, "ralph-parallel/T1", "feature.txt", "f\n");

        // Diverge main so fast-forward is impossible.
        std::fs::write(repo.join("main-only.txt"), "m\n").unwrap();
        run_git(&repo, &["add", "-A"]);
        run_git(&repo, &["commit", "-m", "main moves on"]);

        let mut engine = MergeEngine::new(&repo, "sess").unwrap();
        engine.create_session_backup().unwrap();
        let op_id = engine.enqueue(worker_result("T1", "Feature", "ralph-parallel/T1"));
        engine.process_all().unwrap();

        let op = engine.get(op_id).unwrap();
        assert_eq!(op.status, MergeStatus::Completed);
        assert_eq!(op.strategy, Some(MergeStrategy::MergeCommit));
        assert!(op.merge_commit.is_some());

        let subject = crate::git::run_git(&repo, &["log", "-1", "--pretty=%s"]).unwrap();
        assert_eq!(subject.trimmed(), "feat(T1): Feature");
    }

    #[test]
    fn branch_with_no_commits_ahead_fails_the_op() {
        let (_dir, repo) = create_temp_repo();
        run_git(&repo, &["branch", "ralph-parallel/T1"]);

        let mut engine = MergeEngine::new(&repo, "sess").unwrap();
        engine.create_session_backup().unwrap();
        let op_id = engine.enqueue(worker_result("T1", "Nothing", "ralph-parallel/T1"));
        engine.process_all().unwrap();

        let op = engine.get(op_id).unwrap();
        assert_eq!(op.status, MergeStatus::Failed);
        assert!(op.error.as_deref().unwrap().contains("no commits ahead"));
    }

    #[test]
    fn conflict_aborts_rolls_back_and_reports_files() {
        let (_dir, repo) = create_temp_repo();
        branch_with_commit(&repo, "ralph-parallel/T1", "file.txt", "from branch\n");

        // Conflicting change on main.
        std::fs::write(repo.join("file.txt"), "from main\n").unwrap();
        run_git(&repo, &["add", "-A"]);
        run_git(&repo, &["commit", "-m", "conflicting change"]);
        let pre_merge_head = head_of(&repo);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);

        let mut engine = MergeEngine::new(&repo, "sess").unwrap();
        engine.create_session_backup().unwrap();
        engine.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

        let op_id = engine.enqueue(worker_result("T1", "Conflict", "ralph-parallel/T1"));
        engine.process_all().unwrap();

        let op = engine.get(op_id).unwrap();
        assert_eq!(op.status, MergeStatus::Conflicted);
        assert_eq!(
            op.conflicted_files.as_deref(),
            Some(&["file.txt".to_string()][..])
        );

        // HEAD is back on the pre-merge commit and the tree is clean.
        assert_eq!(head_of(&repo), pre_merge_head);
        let status = crate::git::run_git(&repo, &["status", "--porcelain"]).unwrap();
        assert!(status.stdout.trim().is_empty());

        // The branch survives for manual resolution.
        assert!(crate::git::git_succeeds(
            &repo,
            &["rev-parse", "--verify", "refs/heads/ralph-parallel/T1"]
        )
        .unwrap());

        let events = events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, MergeEvent::ConflictDetected { files, .. } if files.contains(&"file.txt".to_string()))));
    }

    #[test]
    fn queue_preserves_enqueue_order() {
        let (_dir, repo) = create_temp_repo();
        branch_with_commit(&repo, "ralph-parallel/A", "a.txt", "a\n");
        // B builds on main, not on A, so both merge cleanly in order.
        branch_with_commit(&repo, "ralph-parallel/B", "b.txt", "b\n");

        let mut engine = MergeEngine::new(&repo, "sess").unwrap();
        engine.create_session_backup().unwrap();
        let first = engine.enqueue(worker_result("A", "First", "ralph-parallel/A"));
        let second = engine.enqueue(worker_result("B", "Second", "ralph-parallel/B"));

        let processed = engine.process_all().unwrap();
        assert_eq!(processed, vec![first, second]);
        assert!(repo.join("a.txt").exists());
        assert!(repo.join("b.txt").exists());
    }

    #[test]
    fn rollback_merge_restores_backup_tag_state() {
        let (_dir, repo) = create_temp_repo();
        branch_with_commit(&repo, "ralph-parallel/T1", "feature.txt", "f\n");
        let before = head_of(&repo);

        let mut engine = MergeEngine::new(&repo, "sess").unwrap();
        engine.create_session_backup().unwrap();
        let op_id = engine.enqueue(worker_result("T1", "Feature", "ralph-parallel/T1"));
        engine.process_all().unwrap();
        assert_ne!(head_of(&repo), before);

        engine.rollback_merge(op_id).unwrap();
        assert_eq!(head_of(&repo), before);
        assert_eq!(engine.get(op_id).unwrap().status, MergeStatus::RolledBack);
    }

    #[test]
    fn rollback_session_unwinds_all_completed_ops() {
        let (_dir, repo) = create_temp_repo();
        branch_with_commit(&repo, "ralph-parallel/A", "a.txt", "a\n");
        branch_with_commit(&repo, "ralph-parallel/B", "b.txt", "b\n");
        let start = head_of(&repo);

        let mut engine = MergeEngine::new(&repo, "sess").unwrap();
        engine.create_session_backup().unwrap();
        engine.enqueue(worker_result("A", "First", "ralph-parallel/A"));
        engine.enqueue(worker_result("B", "Second", "ralph-parallel/B"));
        engine.process_all().unwrap();
        assert_ne!(head_of(&repo), start);

        engine.rollback_session().unwrap();
        assert_eq!(head_of(&repo), start);
        assert!(engine
            .operations()
            .iter()
            .all(|op| op.status == MergeStatus::RolledBack));
    }

    #[test]
    fn rollback_session_without_backup_is_an_error() {
        let (_dir, repo) = create_temp_repo();
        let mut engine = MergeEngine::new(&repo, "sess").unwrap();
        assert!(matches!(
            engine.rollback_session(),
            Err(MergeError::NoSessionTag)
        ));
    }

    #[test]
    fn session_backup_is_idempotent() {
        let (_dir, repo) = create_temp_repo();
        let mut engine = MergeEngine::new(&repo, "sess").unwrap();
        let a = engine.create_session_backup().unwrap();
        let b = engine.create_session_backup().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn panicking_listener_does_not_break_the_queue() {
        let (_dir, repo) = create_temp_repo();
        branch_with_commit(&repo, "ralph-parallel/T1", "feature.txt", "f\n");

        let mut engine = MergeEngine::new(&repo, "sess").unwrap();
        engine.create_session_backup().unwrap();
        engine.subscribe(|_| panic!("listener bug"));

        let op_id = engine.enqueue(worker_result("T1", "Feature", "ralph-parallel/T1"));
        engine.process_all().unwrap();
        assert_eq!(engine.get(op_id).unwrap().status, MergeStatus::Completed);
    }

    #[test]
    fn invalid_branch_name_fails_without_touching_git() {
        let (_dir, repo) = create_temp_repo();
        let before = head_of(&repo);

        let mut engine = MergeEngine::new(&repo, "sess").unwrap();
        engine.create_session_backup().unwrap();
        let op_id = engine.enqueue(worker_result("T1", "Evil", "bad..ref"));
        engine.process_all().unwrap();

        assert_eq!(engine.get(op_id).unwrap().status, MergeStatus::Failed);
        assert_eq!(head_of(&repo), before);
    }
}
