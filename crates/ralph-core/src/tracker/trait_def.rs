//! The `TrackerPlugin` trait -- the adapter interface for issue backends.
//!
//! Object-safe so implementations can be stored as `Box<dyn TrackerPlugin>`
//! in the [`super::TrackerRegistry`].

use anyhow::Result;
use async_trait::async_trait;

use super::types::{CompleteResult, PrdContext, Task, TaskFilter, TrackerMeta};

/// Adapter interface for task sources.
///
/// `get_tasks` must return the full matching set; silent pagination caps
/// are not allowed. A tracker without status mutation may implement
/// `complete_task` as a no-op that still reports `success: true`.
#[async_trait]
pub trait TrackerPlugin: Send + Sync {
    /// Static capabilities of this tracker.
    fn meta(&self) -> &TrackerMeta;

    /// All tasks matching `filter` (all tasks when `None`).
    async fn get_tasks(&self, filter: Option<&TaskFilter>) -> Result<Vec<Task>>;

    /// Look up one task by id.
    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Mark a task completed in the backing store.
    async fn complete_task(&self, id: &str, reason: Option<&str>) -> Result<CompleteResult>;

    /// The prompt template used for this tracker's tasks.
    fn template(&self) -> String;

    /// Optional product-requirements context for prompts.
    async fn prd_context(&self) -> Result<Option<PrdContext>>;
}

impl std::fmt::Debug for dyn TrackerPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerPlugin")
            .field("id", &self.meta().id)
            .finish()
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn TrackerPlugin) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyTracker {
        meta: TrackerMeta,
    }

    impl EmptyTracker {
        fn new() -> Self {
            Self {
                meta: TrackerMeta {
                    id: "empty".to_string(),
                    name: "Empty".to_string(),
                    supports_bidirectional_sync: false,
                    supports_hierarchy: false,
                    supports_dependencies: false,
                },
            }
        }
    }

    #[async_trait]
    impl TrackerPlugin for EmptyTracker {
        fn meta(&self) -> &TrackerMeta {
            &self.meta
        }

        async fn get_tasks(&self, _filter: Option<&TaskFilter>) -> Result<Vec<Task>> {
            Ok(Vec::new())
        }

        async fn get_task(&self, _id: &str) -> Result<Option<Task>> {
            Ok(None)
        }

        async fn complete_task(
            &self,
            _id: &str,
            _reason: Option<&str>,
        ) -> Result<CompleteResult> {
            Ok(CompleteResult::ok("nothing to do"))
        }

        fn template(&self) -> String {
            super::super::DEFAULT_TEMPLATE.to_string()
        }

        async fn prd_context(&self) -> Result<Option<PrdContext>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn trait_is_usable_as_object() {
        let tracker: Box<dyn TrackerPlugin> = Box::new(EmptyTracker::new());
        assert_eq!(tracker.meta().id, "empty");
        assert!(tracker.get_tasks(None).await.unwrap().is_empty());
        assert!(tracker.get_task("T1").await.unwrap().is_none());
        assert!(tracker.complete_task("T1", None).await.unwrap().success);
        assert!(tracker.prd_context().await.unwrap().is_none());
    }
}
