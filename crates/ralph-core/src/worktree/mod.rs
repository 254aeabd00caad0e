//! Git worktree management for parallel workers.
//!
//! Each worker runs in its own worktree under
//! `<workspace>/.ralph-tui/worktrees/`, on a dedicated
//! `ralph-parallel/<task>` branch. Worktrees share the object store of the
//! main repository but have independent working directories and index
//! files, so workers never touch each other's paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::git::{self, GitError};
use crate::session::session_dir;

/// Limits applied when acquiring worktrees.
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Maximum simultaneously active worktrees.
    pub max_worktrees: usize,
    /// Minimum free disk space required before creating another worktree.
    pub min_free_disk_bytes: u64,
    /// Override for the worktree base directory.
    pub base_dir: Option<PathBuf>,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            max_worktrees: 8,
            min_free_disk_bytes: 500 * 1024 * 1024,
            base_dir: None,
        }
    }
}

/// Bookkeeping for one worker worktree.
#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeInfo {
    pub id: String,
    pub path: PathBuf,
    pub branch: String,
    pub worker_id: Option<usize>,
    pub task_id: String,
    /// `false` means released but still on disk until [`WorktreeManager::cleanup_all`].
    pub active: bool,
    pub dirty: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("worktree limit reached ({active} active, max {max})")]
    LimitReached { active: usize, max: usize },

    #[error("insufficient disk space: {available} bytes available, {required} required")]
    DiskSpace { available: u64, required: u64 },

    #[error("worktree {0} not found")]
    NotFound(String),

    #[error("worktree I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Creates, releases, and destroys per-worker git worktrees.
#[derive(Debug)]
pub struct WorktreeManager {
    repo: PathBuf,
    base: PathBuf,
    config: WorktreeConfig,
    worktrees: Mutex<HashMap<String, WorktreeInfo>>,
}

impl WorktreeManager {
    pub fn new(repo: impl Into<PathBuf>, config: WorktreeConfig) -> Result<Self, WorktreeError> {
        let repo = repo.into();
        git::ensure_repo(&repo)?;

        let base = config
            .base_dir
            .clone()
            .unwrap_or_else(|| session_dir(&repo).join("worktrees"));

        Ok(Self {
            repo,
            base,
            config,
            worktrees: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo
    }

    /// Branch name for a task: `ralph-parallel/<sanitized task id>`.
    pub fn branch_for_task(task_id: &str) -> String {
        format!("ralph-parallel/{}", sanitize_task_id(task_id))
    }

    /// Create a worktree for one worker on the task's dedicated branch.
    pub fn acquire(&self, worker_id: usize, task_id: &str) -> Result<WorktreeInfo, WorktreeError> {
        let active = self.active_count();
        if active >= self.config.max_worktrees {
            return Err(WorktreeError::LimitReached {
                active,
                max: self.config.max_worktrees,
            });
        }
        self.check_disk_space()?;

        let branch = Self::branch_for_task(task_id);
        git::validate_ref_name(&branch)?;

        std::fs::create_dir_all(&self.base)?;

        let id = format!("wt{}-{}", worker_id, sanitize_task_id(task_id).replace('/', "--"));
        let path = self.base.join(&id);

        let branch_exists = git::git_succeeds(
            &self.repo,
            &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
        )?;

        let path_str = path.to_string_lossy();
        let result = if branch_exists {
            git::run_git(&self.repo, &["worktree", "add", &path_str, &branch])
        } else {
            git::run_git(&self.repo, &["worktree", "add", "-b", &branch, &path_str])
        };

        if let Err(e) = result {
            self.cleanup_partial(&path);
            return Err(e.into());
        }

        let info = WorktreeInfo {
            id: id.clone(),
            path,
            branch,
            worker_id: Some(worker_id),
            task_id: task_id.to_string(),
            active: true,
            dirty: false,
            created_at: Utc::now(),
        };

        self.worktrees
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, info.clone());

        tracing::info!(
            worktree = %info.id,
            branch = %info.branch,
            path = %info.path.display(),
            "acquired worktree"
        );
        Ok(info)
    }

    /// Mark a worktree released. The directory stays on disk (and the
    /// branch keeps its commits) until [`cleanup_all`].
    ///
    /// [`cleanup_all`]: WorktreeManager::cleanup_all
    pub fn release(&self, id: &str) -> Result<WorktreeInfo, WorktreeError> {
        let mut worktrees = self.worktrees.lock().unwrap_or_else(|e| e.into_inner());
        let info = worktrees
            .get_mut(id)
            .ok_or_else(|| WorktreeError::NotFound(id.to_string()))?;

        info.active = false;
        info.dirty = git::run_git(&info.path, &["status", "--porcelain"])
            .map(|out| !out.stdout.trim().is_empty())
            .unwrap_or(false);

        Ok(info.clone())
    }

    pub fn get(&self, id: &str) -> Option<WorktreeInfo> {
        self.worktrees
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<WorktreeInfo> {
        let mut all: Vec<WorktreeInfo> = self
            .worktrees
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn active_count(&self) -> usize {
        self.worktrees
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|w| w.active)
            .count()
    }

    /// Remove every tracked worktree and its branch, then the base
    /// directory if it ended up empty.
    pub fn cleanup_all(&self) -> Result<(), WorktreeError> {
        let infos: Vec<WorktreeInfo> = {
            let mut worktrees = self.worktrees.lock().unwrap_or_else(|e| e.into_inner());
            worktrees.drain().map(|(_, info)| info).collect()
        };

        for info in infos {
            let path_str = info.path.to_string_lossy();
            if let Err(e) =
                git::run_git(&self.repo, &["worktree", "remove", "--force", &path_str])
            {
                tracing::warn!(
                    worktree = %info.id,
                    error = %e,
                    "git worktree remove failed, falling back to rmtree + prune"
                );
                let _ = std::fs::remove_dir_all(&info.path);
                let _ = git::run_git(&self.repo, &["worktree", "prune"]);
            }

            if let Err(e) = git::run_git(&self.repo, &["branch", "-D", &info.branch]) {
                // Branch already gone is fine.
                if !matches!(&e, GitError::Exit { stderr, .. } if stderr.contains("not found")) {
                    tracing::warn!(branch = %info.branch, error = %e, "failed to delete branch");
                }
            }
        }

        if self.base.exists()
            && std::fs::read_dir(&self.base)
                .map(|mut d| d.next().is_none())
                .unwrap_or(false)
        {
            std::fs::remove_dir(&self.base)?;
        }

        Ok(())
    }

    /// Idempotently add the metadata directory to the repo's `.gitignore`.
    pub fn ensure_gitignore(&self) -> std::io::Result<()> {
        let path = self.repo.join(".gitignore");
        let existing = std::fs::read_to_string(&path).unwrap_or_default();

        if existing.lines().any(|l| l.trim() == ".ralph-tui/") {
            return Ok(());
        }

        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str("# ralph worktrees and session metadata\n.ralph-tui/\n");
        std::fs::write(&path, updated)
    }

    fn check_disk_space(&self) -> Result<(), WorktreeError> {
        // If the platform cannot report free space, skip the check.
        match fs2::available_space(&self.repo) {
            Ok(available) if available < self.config.min_free_disk_bytes => {
                Err(WorktreeError::DiskSpace {
                    available,
                    required: self.config.min_free_disk_bytes,
                })
            }
            _ => Ok(()),
        }
    }

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = git::run_git(&self.repo, &["worktree", "prune"]);
    }
}

/// Turn an arbitrary task id into a branch-name component.
///
/// Whitespace and git-hostile characters become dashes; control characters
/// are dropped; runs of `/`, `-`, `.` collapse; leading/trailing
/// dot/dash/slash are stripped; a `.lock` suffix is removed. An id with
/// nothing left derives an 8-char alphanumeric name from its base64.
pub fn sanitize_task_id(task_id: &str) -> String {
    let mut mapped = String::with_capacity(task_id.len());
    for ch in task_id.chars() {
        if ch.is_control() {
            continue;
        }
        if ch.is_whitespace()
            || matches!(ch, '~' | '^' | ':' | '?' | '*' | '[' | '\\' | '@' | '{' | '}')
        {
            mapped.push('-');
        } else {
            mapped.push(ch);
        }
    }

    let mut collapsed = String::with_capacity(mapped.len());
    let mut prev = None;
    for ch in mapped.chars() {
        if matches!(ch, '/' | '-' | '.') && prev == Some(ch) {
            continue;
        }
        collapsed.push(ch);
        prev = Some(ch);
    }

    let mut name = collapsed
        .trim_matches(|c| matches!(c, '.' | '-' | '/'))
        .to_string();
    while name.ends_with(".lock") {
        name.truncate(name.len() - ".lock".len());
        name = name
            .trim_matches(|c| matches!(c, '.' | '-' | '/'))
            .to_string();
    }

    if name.is_empty() {
        fallback_name(task_id)
    } else {
        name
    }
}

fn fallback_name(task_id: &str) -> String {
    use base64::Engine as _;
    let encoded = base64::engine::general_purpose::STANDARD.encode(task_id.as_bytes());
    let name: String = encoded
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    if name.is_empty() {
        "task0000".to_string()
    } else {
        name
    }
}
