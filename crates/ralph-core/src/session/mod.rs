//! Session lifecycle: workspace lock, persisted state, and the
//! cross-workspace registry.

pub mod lock;
pub mod registry;
pub mod state;

use std::path::{Path, PathBuf};

/// Name of the per-workspace metadata directory.
pub const SESSION_DIR: &str = ".ralph-tui";

/// Return `<workspace>/.ralph-tui`, the home of all core-owned artifacts.
pub fn session_dir(workspace: &Path) -> PathBuf {
    workspace.join(SESSION_DIR)
}

/// Create the metadata directory and make it self-ignoring, so `git add -A`
/// in the workspace never stages session files.
pub fn ensure_session_dir(workspace: &Path) -> std::io::Result<PathBuf> {
    let dir = session_dir(workspace);
    std::fs::create_dir_all(&dir)?;
    let ignore = dir.join(".gitignore");
    if !ignore.exists() {
        std::fs::write(&ignore, "*\n")?;
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_dir_is_self_ignoring() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = ensure_session_dir(tmp.path()).unwrap();
        assert!(dir.ends_with(SESSION_DIR));
        assert_eq!(std::fs::read_to_string(dir.join(".gitignore")).unwrap(), "*\n");

        // Idempotent, and keeps an operator-edited ignore file.
        std::fs::write(dir.join(".gitignore"), "custom\n").unwrap();
        ensure_session_dir(tmp.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.join(".gitignore")).unwrap(),
            "custom\n"
        );
    }
}
