//! Persisted session state.
//!
//! Saved to `<workspace>/.ralph-tui/session.json` with atomic writes
//! (temp file + rename). Readers tolerate a missing or partial file as
//! "no saved state". The task set is captured at initialization; later
//! writes only append to `iteration_history` and flip per-task `completed`
//! flags.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::session_dir;
use crate::tracker::{Task, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Interrupted,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            SessionStatus::Running | SessionStatus::Paused | SessionStatus::Interrupted
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The slice of a tracker task the session needs to remember.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub completed: bool,
}

impl TaskSnapshot {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            priority: task.priority,
            completed: task.status == TaskStatus::Completed,
        }
    }
}

/// One line of iteration history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: u32,
    pub task_id: String,
    pub task_title: String,
    pub success: bool,
    pub task_completed: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSessionState {
    pub session_id: String,
    pub agent_plugin: String,
    pub model: Option<String>,
    pub tracker_plugin: String,
    pub epic_id: Option<String>,
    pub prd_path: Option<PathBuf>,
    pub max_iterations: u32,
    pub cwd: PathBuf,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub tasks: Vec<TaskSnapshot>,
    pub current_iteration: u32,
    pub iteration_history: Vec<IterationSummary>,
}

impl PersistedSessionState {
    pub fn is_resumable(&self) -> bool {
        self.status.is_resumable()
    }

    /// Count of snapshots marked completed.
    pub fn tasks_completed(&self) -> usize {
        self.tasks.iter().filter(|t| t.completed).count()
    }

    /// Flip the `completed` flag for a task id.
    pub fn mark_task_completed(&mut self, task_id: &str) {
        if let Some(snapshot) = self.tasks.iter_mut().find(|t| t.id == task_id) {
            snapshot.completed = true;
            snapshot.status = TaskStatus::Completed;
        }
    }
}

/// Return `<workspace>/.ralph-tui/session.json`.
pub fn state_path(workspace: &Path) -> PathBuf {
    session_dir(workspace).join("session.json")
}

/// Load persisted state; missing or unparseable files mean "no saved state".
pub fn load(workspace: &Path) -> Option<PersistedSessionState> {
    let contents = std::fs::read_to_string(state_path(workspace)).ok()?;
    match serde_json::from_str(&contents) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring unparseable session state");
            None
        }
    }
}

/// Write state atomically (temp file + rename).
pub fn save(workspace: &Path, state: &PersistedSessionState) -> std::io::Result<()> {
    super::ensure_session_dir(workspace)?;

    let path = state_path(workspace);
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(state)?;
    std::fs::write(&tmp, payload)?;
    std::fs::rename(&tmp, &path)
}

/// Delete the state file; missing is fine.
pub fn remove(workspace: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(state_path(workspace)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state(workspace: &Path) -> PersistedSessionState {
        PersistedSessionState {
            session_id: "sess-1".to_string(),
            agent_plugin: "test".to_string(),
            model: None,
            tracker_plugin: "json-prd".to_string(),
            epic_id: None,
            prd_path: None,
            max_iterations: 5,
            cwd: workspace.to_path_buf(),
            started_at: Utc::now(),
            status: SessionStatus::Running,
            tasks: vec![TaskSnapshot {
                id: "T1".to_string(),
                title: "Add hello".to_string(),
                status: TaskStatus::Open,
                priority: 2,
                completed: false,
            }],
            current_iteration: 0,
            iteration_history: Vec::new(),
        }
    }

    #[test]
    fn save_load_is_identity() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state = sample_state(tmp.path());

        save(tmp.path(), &state).unwrap();
        let loaded = load(tmp.path()).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn load_then_save_is_byte_equivalent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let state = sample_state(tmp.path());
        save(tmp.path(), &state).unwrap();

        let before = std::fs::read(state_path(tmp.path())).unwrap();
        let loaded = load(tmp.path()).unwrap();
        save(tmp.path(), &loaded).unwrap();
        let after = std::fs::read(state_path(tmp.path())).unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn missing_file_is_none() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(load(tmp.path()).is_none());
    }

    #[test]
    fn partial_file_is_none() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(session_dir(tmp.path())).unwrap();
        std::fs::write(state_path(tmp.path()), "{\"session_id\": \"trunc").unwrap();
        assert!(load(tmp.path()).is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        remove(tmp.path()).unwrap();

        let state = sample_state(tmp.path());
        save(tmp.path(), &state).unwrap();
        remove(tmp.path()).unwrap();
        assert!(load(tmp.path()).is_none());
        remove(tmp.path()).unwrap();
    }

    #[test]
    fn resumable_statuses() {
        for (status, resumable) in [
            (SessionStatus::Running, true),
            (SessionStatus::Paused, true),
            (SessionStatus::Interrupted, true),
            (SessionStatus::Completed, false),
            (SessionStatus::Failed, false),
        ] {
            assert_eq!(status.is_resumable(), resumable, "{status}");
        }
    }

    #[test]
    fn mark_task_completed_flips_flag_and_status() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut state = sample_state(tmp.path());
        state.mark_task_completed("T1");
        assert!(state.tasks[0].completed);
        assert_eq!(state.tasks[0].status, TaskStatus::Completed);
        assert_eq!(state.tasks_completed(), 1);
    }
}
