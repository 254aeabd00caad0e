//! Task model shared between tracker plugins and the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    /// Whether the engine may pick this task up.
    pub fn is_workable(self) -> bool {
        matches!(self, TaskStatus::Open | TaskStatus::InProgress)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A unit of work as reported by a tracker.
///
/// Owned by the tracker plugin; the core only reads it. A task reaches
/// `completed` exclusively through [`super::TrackerPlugin::complete_task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    /// Lower value = higher priority.
    #[serde(default)]
    pub priority: i64,
    pub description: Option<String>,
    pub acceptance_criteria: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub blocks: Vec<String>,
    pub parent_id: Option<String>,
    pub assignee: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A minimal open task; the rest of the fields default to empty.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: TaskStatus::Open,
            priority: 0,
            description: None,
            acceptance_criteria: None,
            labels: Vec::new(),
            depends_on: Vec::new(),
            blocks: Vec::new(),
            parent_id: None,
            assignee: None,
            created_at: None,
            updated_at: None,
        }
    }
}

/// Filter handed to [`super::TrackerPlugin::get_tasks`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    /// Empty means "any status".
    pub statuses: Vec<TaskStatus>,
    /// A task matches when it carries any of these labels; empty means
    /// "any labels".
    pub labels: Vec<String>,
    pub epic_id: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if !self.labels.is_empty() && !self.labels.iter().any(|l| task.labels.contains(l)) {
            return false;
        }
        if let Some(epic) = &self.epic_id {
            if task.parent_id.as_deref() != Some(epic.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Result of a `complete_task` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteResult {
    pub success: bool,
    pub message: String,
    pub error: Option<String>,
}

impl CompleteResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            message: String::new(),
            error: Some(error),
        }
    }
}

/// Product-requirements context a tracker can attach to prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrdContext {
    pub name: String,
    pub description: String,
    pub content: String,
    pub completed_count: usize,
    pub total_count: usize,
}

/// Static capabilities of a tracker plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerMeta {
    pub id: String,
    pub name: String,
    pub supports_bidirectional_sync: bool,
    pub supports_hierarchy: bool,
    pub supports_dependencies: bool,
}
