//! Auto-commit for completed iterations.
//!
//! After an iteration finishes with the completion marker, the engine stages
//! and commits everything the agent changed in the workspace. A clean tree
//! is a successful no-op, so calling this twice cannot create two commits.

use std::path::Path;

use super::{GitError, run_git};

/// Outcome of an auto-commit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Whether a commit was created.
    pub committed: bool,
    /// Short sha of the created commit.
    pub sha: Option<String>,
    /// Why nothing was committed, when `committed` is false.
    pub skip_reason: Option<String>,
}

/// Stage all changes and commit them as `feat: <task_id> - <task_title>`.
pub fn auto_commit(
    workspace: &Path,
    task_id: &str,
    task_title: &str,
) -> Result<CommitOutcome, GitError> {
    let status = run_git(workspace, &["status", "--porcelain"])?;
    if status.stdout.trim().is_empty() {
        return Ok(CommitOutcome {
            committed: false,
            sha: None,
            skip_reason: Some("no uncommitted changes".to_string()),
        });
    }

    run_git(workspace, &["add", "-A"])?;

    let message = format!("feat: {task_id} - {task_title}");
    run_git(workspace, &["commit", "-m", &message])?;

    let sha = run_git(workspace, &["rev-parse", "--short", "HEAD"])?
        .trimmed()
        .to_string();

    Ok(CommitOutcome {
        committed: true,
        sha: Some(sha),
        skip_reason: None,
    })
}
