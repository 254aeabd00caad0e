//! Per-workspace exclusive session lock.
//!
//! The lock is a JSON file created with `O_EXCL` semantics. An existing
//! lock is honored unless it is stale: its pid is no longer alive, or it
//! was acquired more than [`STALE_AFTER_SECS`] ago. Stale locks are
//! replaced atomically (temp file + rename).

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::session_dir;

/// A lock older than this is considered stale even if its pid looks alive.
pub const STALE_AFTER_SECS: i64 = 3600;

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub session_id: String,
    pub pid: u32,
    pub cwd: PathBuf,
    pub acquired_at: DateTime<Utc>,
    pub hostname: String,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("workspace is locked by PID {pid} (session {session_id})")]
    Held { pid: u32, session_id: String },

    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// RAII guard for a held lock; releases on drop.
#[derive(Debug)]
pub struct SessionLockGuard {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl SessionLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the lock file now instead of at drop time.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // Only delete the file if it is still ours; a stale takeover by
        // another process must not lose its lock.
        if read_lock_file(&self.path).is_none_or(|info| info.pid == self.pid) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Return `<workspace>/.ralph-tui/session.lock`.
pub fn lock_path(workspace: &Path) -> PathBuf {
    session_dir(workspace).join("session.lock")
}

/// Acquire the workspace lock.
///
/// `force` replaces a live lock after the operator confirmed the override;
/// stale locks are replaced without it.
pub fn acquire(
    workspace: &Path,
    session_id: &str,
    force: bool,
) -> Result<SessionLockGuard, LockError> {
    super::ensure_session_dir(workspace)?;

    let path = lock_path(workspace);
    let info = LockInfo {
        session_id: session_id.to_string(),
        pid: std::process::id(),
        cwd: workspace.to_path_buf(),
        acquired_at: Utc::now(),
        hostname: hostname(),
    };
    let payload = serde_json::to_string_pretty(&info)?;

    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(mut file) => {
            file.write_all(payload.as_bytes())?;
            Ok(SessionLockGuard {
                path,
                pid: info.pid,
                released: false,
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let existing = read_lock_file(&path);
            // An unreadable lock file is treated as stale.
            let replaceable = existing.as_ref().map(is_stale).unwrap_or(true) || force;

            if !replaceable {
                let held = existing.expect("non-stale lock must be readable");
                return Err(LockError::Held {
                    pid: held.pid,
                    session_id: held.session_id,
                });
            }

            tracing::warn!(
                path = %path.display(),
                forced = force,
                "replacing stale or overridden session lock"
            );
            let tmp = path.with_extension("lock.tmp");
            std::fs::write(&tmp, payload)?;
            std::fs::rename(&tmp, &path)?;
            Ok(SessionLockGuard {
                path,
                pid: info.pid,
                released: false,
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Read the current lock, if any.
pub fn read_lock(workspace: &Path) -> Option<LockInfo> {
    read_lock_file(&lock_path(workspace))
}

fn read_lock_file(path: &Path) -> Option<LockInfo> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// A lock is stale when its pid is gone or it exceeded the age threshold.
pub fn is_stale(info: &LockInfo) -> bool {
    if !pid_alive(info.pid) {
        return true;
    }
    (Utc::now() - info.acquired_at).num_seconds() > STALE_AFTER_SECS
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes existence. EPERM means the process exists but is not
    // ours, which still counts as alive.
    // SAFETY: signal 0 delivers nothing.
    let ret = unsafe { libc::kill(pid as i32, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // SAFETY: buf is a valid writable buffer of the stated length.
        let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if ret == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if let Ok(name) = std::str::from_utf8(&buf[..end]) {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_lock_file_with_own_pid() {
        let tmp = tempfile::TempDir::new().unwrap();
        let guard = acquire(tmp.path(), "s1", false).unwrap();

        let info = read_lock(tmp.path()).unwrap();
        assert_eq!(info.session_id, "s1");
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.cwd, tmp.path());

        drop(guard);
        assert!(read_lock(tmp.path()).is_none(), "lock released on drop");
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let tmp = tempfile::TempDir::new().unwrap();
        let _guard = acquire(tmp.path(), "s1", false).unwrap();

        let err = acquire(tmp.path(), "s2", false).unwrap_err();
        match err {
            LockError::Held { pid, session_id } => {
                assert_eq!(pid, std::process::id());
                assert_eq!(session_id, "s1");
            }
            other => panic!("expected Held, got {other:?}"),
        }
    }

    #[test]
    fn force_replaces_live_lock() {
        let tmp = tempfile::TempDir::new().unwrap();
        let _guard = acquire(tmp.path(), "s1", false).unwrap();

        let guard2 = acquire(tmp.path(), "s2", true).unwrap();
        assert_eq!(read_lock(tmp.path()).unwrap().session_id, "s2");
        drop(guard2);
    }

    #[test]
    fn dead_pid_lock_is_stale_and_replaced() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(session_dir(tmp.path())).unwrap();

        let dead = LockInfo {
            session_id: "old".to_string(),
            pid: 999_999_9,
            cwd: tmp.path().to_path_buf(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            hostname: "elsewhere".to_string(),
        };
        assert!(is_stale(&dead));
        std::fs::write(
            lock_path(tmp.path()),
            serde_json::to_string_pretty(&dead).unwrap(),
        )
        .unwrap();

        // No --force needed: the stale lock is replaced.
        let guard = acquire(tmp.path(), "fresh", false).unwrap();
        assert_eq!(read_lock(tmp.path()).unwrap().session_id, "fresh");
        drop(guard);
    }

    #[test]
    fn aged_lock_is_stale_even_with_live_pid() {
        let tmp = tempfile::TempDir::new().unwrap();
        let info = LockInfo {
            session_id: "old".to_string(),
            pid: std::process::id(),
            cwd: tmp.path().to_path_buf(),
            acquired_at: Utc::now() - chrono::Duration::seconds(STALE_AFTER_SECS + 60),
            hostname: hostname(),
        };
        assert!(is_stale(&info));
    }

    #[test]
    fn fresh_lock_with_live_pid_is_not_stale() {
        let tmp = tempfile::TempDir::new().unwrap();
        let info = LockInfo {
            session_id: "current".to_string(),
            pid: std::process::id(),
            cwd: tmp.path().to_path_buf(),
            acquired_at: Utc::now(),
            hostname: hostname(),
        };
        assert!(!is_stale(&info));
    }

    #[test]
    fn unreadable_lock_file_is_treated_as_stale() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(session_dir(tmp.path())).unwrap();
        std::fs::write(lock_path(tmp.path()), "not json").unwrap();

        let guard = acquire(tmp.path(), "fresh", false).unwrap();
        assert_eq!(read_lock(tmp.path()).unwrap().session_id, "fresh");
        drop(guard);
    }

    #[test]
    fn release_is_explicit_and_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let guard = acquire(tmp.path(), "s1", false).unwrap();
        guard.release();
        assert!(read_lock(tmp.path()).is_none());

        // Re-acquire works immediately after release.
        let guard = acquire(tmp.path(), "s2", false).unwrap();
        drop(guard);
    }
}
