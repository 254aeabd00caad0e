//! JSON PRD tracker.
//!
//! Backed by a single JSON document holding the product name, a
//! description, and a `tasks` array. `complete_task` rewrites the document
//! atomically, so the tracker is bidirectional.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::trait_def::TrackerPlugin;
use super::types::{CompleteResult, PrdContext, Task, TaskFilter, TaskStatus, TrackerMeta};

/// On-disk shape of the PRD document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PrdDocument {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tasks: Vec<Task>,
}

pub struct JsonPrdTracker {
    path: PathBuf,
    meta: TrackerMeta,
}

impl JsonPrdTracker {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            meta: TrackerMeta {
                id: "json-prd".to_string(),
                name: "JSON PRD".to_string(),
                supports_bidirectional_sync: true,
                supports_hierarchy: true,
                supports_dependencies: true,
            },
        }
    }

    fn load(&self) -> Result<PrdDocument> {
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read PRD file at {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse PRD file at {}", self.path.display()))
    }

    fn store(&self, doc: &PrdDocument) -> Result<()> {
        let payload = serde_json::to_string_pretty(doc).context("failed to serialize PRD")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, payload)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl TrackerPlugin for JsonPrdTracker {
    fn meta(&self) -> &TrackerMeta {
        &self.meta
    }

    async fn get_tasks(&self, filter: Option<&TaskFilter>) -> Result<Vec<Task>> {
        let doc = self.load()?;
        Ok(match filter {
            Some(filter) => doc.tasks.into_iter().filter(|t| filter.matches(t)).collect(),
            None => doc.tasks,
        })
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let doc = self.load()?;
        Ok(doc.tasks.into_iter().find(|t| t.id == id))
    }

    async fn complete_task(&self, id: &str, reason: Option<&str>) -> Result<CompleteResult> {
        let mut doc = self.load()?;

        let Some(task) = doc.tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(CompleteResult::failed(format!("task {id} not found")));
        };

        if task.status == TaskStatus::Completed {
            return Ok(CompleteResult::ok(format!("task {id} was already completed")));
        }

        task.status = TaskStatus::Completed;
        task.updated_at = Some(Utc::now());
        self.store(&doc)?;

        tracing::info!(task_id = id, reason = reason.unwrap_or(""), "task completed in PRD");
        Ok(CompleteResult::ok(format!("task {id} marked completed")))
    }

    fn template(&self) -> String {
        super::DEFAULT_TEMPLATE.to_string()
    }

    async fn prd_context(&self) -> Result<Option<PrdContext>> {
        let doc = self.load()?;
        let total_count = doc.tasks.len();
        let completed_count = doc
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();

        let mut content = format!("{}\n\n", doc.description.trim());
        for task in &doc.tasks {
            let mark = if task.status == TaskStatus::Completed {
                "x"
            } else {
                " "
            };
            content.push_str(&format!("- [{mark}] {}: {}\n", task.id, task.title));
        }

        Ok(Some(PrdContext {
            name: doc.name,
            description: doc.description,
            content,
            completed_count,
            total_count,
        }))
    }
}
