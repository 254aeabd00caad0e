//! Cross-workspace session registry.
//!
//! A single JSON index (by default `<user_config_dir>/sessions.json`) of
//! active and resumable sessions, keyed by session id and workspace path.
//! The per-workspace session lock serializes writers for any one workspace;
//! writes to the index itself are atomic.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::SessionStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub cwd: PathBuf,
    pub status: SessionStatus,
    pub agent_plugin: String,
    pub tracker_plugin: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// File-backed registry handle.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    path: PathBuf,
}

impl SessionRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The registry file inside a user config directory.
    pub fn in_config_dir(config_dir: &Path) -> Self {
        Self::new(config_dir.join("sessions.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries; a missing or unparseable index reads as empty.
    pub fn list(&self) -> Vec<SessionEntry> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        serde_json::from_str(&contents).unwrap_or_default()
    }

    /// Insert or replace the entry for this session.
    ///
    /// Any previous entry with the same session id or the same workspace
    /// path is superseded (the workspace lock guarantees one session per
    /// workspace).
    pub fn upsert(&self, entry: SessionEntry) -> std::io::Result<()> {
        let mut entries = self.list();
        entries.retain(|e| e.session_id != entry.session_id && e.cwd != entry.cwd);
        entries.push(entry);
        self.write(&entries)
    }

    /// Update just the status of an entry.
    pub fn set_status(&self, session_id: &str, status: SessionStatus) -> std::io::Result<()> {
        let mut entries = self.list();
        for entry in &mut entries {
            if entry.session_id == session_id {
                entry.status = status;
                entry.updated_at = Utc::now();
            }
        }
        self.write(&entries)
    }

    /// Remove the entry for a session id; missing is fine.
    pub fn remove(&self, session_id: &str) -> std::io::Result<()> {
        let mut entries = self.list();
        entries.retain(|e| e.session_id != session_id);
        self.write(&entries)
    }

    pub fn find(&self, session_id: &str) -> Option<SessionEntry> {
        self.list().into_iter().find(|e| e.session_id == session_id)
    }

    pub fn find_by_workspace(&self, cwd: &Path) -> Option<SessionEntry> {
        self.list().into_iter().find(|e| e.cwd == cwd)
    }

    /// Entries whose status allows resuming.
    pub fn resumable(&self) -> Vec<SessionEntry> {
        self.list()
            .into_iter()
            .filter(|e| e.status.is_resumable())
            .collect()
    }

    fn write(&self, entries: &[SessionEntry]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(session_id: &str, cwd: &Path, status: SessionStatus) -> SessionEntry {
        SessionEntry {
            session_id: session_id.to_string(),
            cwd: cwd.to_path_buf(),
            status,
            agent_plugin: "test".to_string(),
            tracker_plugin: "json-prd".to_string(),
            started_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn empty_registry_lists_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = SessionRegistry::in_config_dir(tmp.path());
        assert!(registry.list().is_empty());
        assert!(registry.find("nope").is_none());
    }

    #[test]
    fn upsert_and_find() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ws = tmp.path().join("ws");
        let registry = SessionRegistry::in_config_dir(tmp.path());

        registry
            .upsert(entry("s1", &ws, SessionStatus::Running))
            .unwrap();

        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.find("s1").unwrap().session_id, "s1");
        assert_eq!(registry.find_by_workspace(&ws).unwrap().session_id, "s1");
    }

    #[test]
    fn new_session_in_same_workspace_supersedes_old() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ws = tmp.path().join("ws");
        let registry = SessionRegistry::in_config_dir(tmp.path());

        registry
            .upsert(entry("s1", &ws, SessionStatus::Interrupted))
            .unwrap();
        registry
            .upsert(entry("s2", &ws, SessionStatus::Running))
            .unwrap();

        let entries = registry.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_id, "s2");
    }

    #[test]
    fn set_status_and_resumable_filter() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = SessionRegistry::in_config_dir(tmp.path());
        registry
            .upsert(entry("s1", &tmp.path().join("a"), SessionStatus::Running))
            .unwrap();
        registry
            .upsert(entry("s2", &tmp.path().join("b"), SessionStatus::Running))
            .unwrap();

        registry.set_status("s2", SessionStatus::Completed).unwrap();

        let resumable = registry.resumable();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].session_id, "s1");
    }

    #[test]
    fn remove_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = SessionRegistry::in_config_dir(tmp.path());
        registry
            .upsert(entry("s1", &tmp.path().join("a"), SessionStatus::Running))
            .unwrap();

        registry.remove("s1").unwrap();
        registry.remove("s1").unwrap();
        assert!(registry.list().is_empty());
    }

    #[test]
    fn corrupt_index_reads_as_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = SessionRegistry::in_config_dir(tmp.path());
        std::fs::create_dir_all(tmp.path()).unwrap();
        std::fs::write(registry.path(), "boom").unwrap();
        assert!(registry.list().is_empty());
    }
}
