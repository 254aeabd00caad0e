//! Shared test helpers: temporary git repositories and fake agent scripts.
//!
//! Fake agents are small shell scripts that imitate an agent CLI's output
//! (JSONL or plain text), so the engine and adapters can be exercised
//! end-to-end without any real agent installed.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard, OnceLock};

use tempfile::TempDir;

/// Create a temporary git repository with an initial commit.
///
/// Returns the `TempDir` (must be held alive) and the repo path.
pub fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    run_git(&repo_path, &["init", "-b", "main"]);
    run_git(&repo_path, &["config", "user.email", "test@ralph.dev"]);
    run_git(&repo_path, &["config", "user.name", "Ralph Test"]);

    std::fs::write(repo_path.join("README.md"), "# Test repo\n")
        .expect("failed to write README");
    run_git(&repo_path, &["add", "."]);
    run_git(&repo_path, &["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// Run a git command in a test repo, panicking on failure.
pub fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed to run: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Write an executable `/bin/sh` script into `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("failed to write script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod script");
    }

    path
}

/// Write a fake agent that prints the given plain-text lines on stdout.
///
/// The script ignores its stdin (the prompt) after draining it, like a real
/// agent CLI in non-interactive mode.
pub fn write_fake_agent(dir: &Path, name: &str, stdout_lines: &[&str]) -> PathBuf {
    let mut body = String::from("cat > /dev/null\n");
    for line in stdout_lines {
        let escaped = line.replace('\'', "'\\''");
        body.push_str(&format!("echo '{escaped}'\n"));
    }
    write_script(dir, name, &body)
}

/// Serialise tests that mutate the process environment.
pub fn lock_env() -> MutexGuard<'static, ()> {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
