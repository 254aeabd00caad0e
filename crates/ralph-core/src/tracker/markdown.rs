//! Markdown checklist tracker.
//!
//! Reads `- [ ]` / `- [x]` items from a markdown file. The file is treated
//! as read-only: `complete_task` is a no-op that still reports success, the
//! case the contract explicitly allows for trackers without status
//! mutation.
//!
//! An item may carry an explicit id (`- [ ] T1: Title`); otherwise ids are
//! assigned positionally (`task-1`, `task-2`, ...). Priority follows file
//! order.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::trait_def::TrackerPlugin;
use super::types::{CompleteResult, PrdContext, Task, TaskFilter, TaskStatus, TrackerMeta};

pub struct MarkdownTracker {
    path: PathBuf,
    meta: TrackerMeta,
}

impl MarkdownTracker {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            meta: TrackerMeta {
                id: "markdown".to_string(),
                name: "Markdown checklist".to_string(),
                supports_bidirectional_sync: false,
                supports_hierarchy: false,
                supports_dependencies: false,
            },
        }
    }

    fn load(&self) -> Result<Vec<Task>> {
        let contents = std::fs::read_to_string(&self.path).with_context(|| {
            format!("failed to read checklist at {}", self.path.display())
        })?;
        Ok(parse_checklist(&contents))
    }
}

fn parse_checklist(contents: &str) -> Vec<Task> {
    let mut tasks = Vec::new();

    for line in contents.lines() {
        let trimmed = line.trim_start();
        let (done, rest) = if let Some(rest) = trimmed.strip_prefix("- [ ] ") {
            (false, rest)
        } else if let Some(rest) = trimmed.strip_prefix("- [x] ") {
            (true, rest)
        } else if let Some(rest) = trimmed.strip_prefix("- [X] ") {
            (true, rest)
        } else {
            continue;
        };

        let index = tasks.len() + 1;
        let (id, title) = split_id(rest, index);

        let mut task = Task::new(id, title);
        task.status = if done {
            TaskStatus::Completed
        } else {
            TaskStatus::Open
        };
        task.priority = index as i64;
        tasks.push(task);
    }

    tasks
}

/// `"T1: Title"` -> `("T1", "Title")`; otherwise a positional id.
fn split_id(rest: &str, index: usize) -> (String, String) {
    if let Some((head, tail)) = rest.split_once(':') {
        let head = head.trim();
        let looks_like_id = !head.is_empty()
            && head.len() <= 16
            && !head.contains(' ')
            && head.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if looks_like_id {
            return (head.to_string(), tail.trim().to_string());
        }
    }
    (format!("task-{index}"), rest.trim().to_string())
}

#[async_trait]
impl TrackerPlugin for MarkdownTracker {
    fn meta(&self) -> &TrackerMeta {
        &self.meta
    }

    async fn get_tasks(&self, filter: Option<&TaskFilter>) -> Result<Vec<Task>> {
        let tasks = self.load()?;
        Ok(match filter {
            Some(filter) => tasks.into_iter().filter(|t| filter.matches(t)).collect(),
            None => tasks,
        })
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.load()?.into_iter().find(|t| t.id == id))
    }

    async fn complete_task(&self, id: &str, _reason: Option<&str>) -> Result<CompleteResult> {
        // Read-only backend: completion is recorded by the engine's session
        // state, not here.
        Ok(CompleteResult::ok(format!(
            "task {id} completion recorded (checklist is read-only)"
        )))
    }

    fn template(&self) -> String {
        super::DEFAULT_TEMPLATE.to_string()
    }

    async fn prd_context(&self) -> Result<Option<PrdContext>> {
        let tasks = self.load()?;
        if tasks.is_empty() {
            return Ok(None);
        }

        let total_count = tasks.len();
        let completed_count = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();

        let name = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("checklist")
            .to_string();
        let content = std::fs::read_to_string(&self.path)?;

        Ok(Some(PrdContext {
            name,
            description: String::new(),
            content,
            completed_count,
            total_count,
        }))
    }
}
