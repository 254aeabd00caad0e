//! Centralized git plumbing.
//!
//! Every git invocation in this crate goes through [`run_git`]: an explicit
//! argv list with captured stdio, never a shell string. Ref names that
//! originate outside this crate (task ids, branch names, tags) must pass
//! [`validate_ref_name`] before they reach the binary.

pub mod commit;

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

/// Errors from git invocations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The path is not inside a git repository.
    #[error("not a git repository: {0}")]
    NotARepo(PathBuf),

    /// The `git` binary could not be executed at all.
    #[error("failed to run git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A caller-supplied ref name failed the conservative format check.
    #[error("invalid ref name: {0:?}")]
    InvalidRef(String),
}

/// Captured output of a successful git command.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Stdout with trailing whitespace stripped, for single-value commands
    /// such as `rev-parse`.
    pub fn trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Run a git command in `dir` and return its output.
///
/// Returns [`GitError::Exit`] when git exits non-zero. Arguments are passed
/// as an explicit list; nothing is interpreted by a shell.
pub fn run_git(dir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| GitError::Spawn {
            command: args.join(" "),
            source: e,
        })?;

    if !output.status.success() {
        return Err(GitError::Exit {
            command: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    Ok(GitOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Run a git command and report only whether it exited zero.
///
/// Used for probes such as `rev-parse --verify` where a non-zero exit is an
/// answer, not an error.
pub fn git_succeeds(dir: &Path, args: &[&str]) -> Result<bool, GitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| GitError::Spawn {
            command: args.join(" "),
            source: e,
        })?;
    Ok(output.status.success())
}

/// Verify that `dir` is inside a git repository.
pub fn ensure_repo(dir: &Path) -> Result<(), GitError> {
    if git_succeeds(dir, &["rev-parse", "--git-dir"])? {
        Ok(())
    } else {
        Err(GitError::NotARepo(dir.to_path_buf()))
    }
}

/// Return the current HEAD commit sha.
pub fn head_sha(dir: &Path) -> Result<String, GitError> {
    Ok(run_git(dir, &["rev-parse", "HEAD"])?.trimmed().to_string())
}

/// Conservative ref-name check applied to every branch and tag name built
/// from external input.
///
/// Rejects: empty names, `..`, a leading or trailing dot, a `.lock` suffix,
/// control characters, space, the characters `~ ^ : ? * [ \`, and the `@{`
/// sequence. This is stricter than `git check-ref-format` but every name it
/// accepts is valid for git.
pub fn validate_ref_name(name: &str) -> Result<(), GitError> {
    let invalid = || GitError::InvalidRef(name.to_string());

    if name.is_empty()
        || name.starts_with('.')
        || name.ends_with('.')
        || name.ends_with('/')
        || name.starts_with('/')
        || name.ends_with(".lock")
        || name.contains("..")
        || name.contains("//")
        || name.contains("@{")
    {
        return Err(invalid());
    }

    for ch in name.chars() {
        if ch.is_control() || ch == ' ' {
            return Err(invalid());
        }
        if matches!(ch, '~' | '^' | ':' | '?' | '*' | '[' | '\\') {
            return Err(invalid());
        }
    }

    // No component may start with a dot or end with `.lock`.
    for component in name.split('/') {
        if component.is_empty() || component.starts_with('.') || component.ends_with(".lock") {
            return Err(invalid());
        }
    }

    Ok(())
}
