//! Tracker registry -- a compile-time-registered table of tracker factories.
//!
//! Factories rather than instances: the engine re-creates plugin instances
//! on resume, and two engines must never share tracker state.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Result, bail};

use super::trait_def::TrackerPlugin;
use super::{JsonPrdTracker, MarkdownTracker};

/// Resolved configuration a tracker factory receives.
#[derive(Debug, Clone, Default)]
pub struct TrackerConfig {
    /// Workspace the tracker's files are resolved against.
    pub cwd: PathBuf,
    /// Restrict to children of this epic.
    pub epic_id: Option<String>,
    /// Path to the PRD or checklist file backing the tracker.
    pub prd_path: Option<PathBuf>,
}

type TrackerFactory = Box<dyn Fn(&TrackerConfig) -> Result<Box<dyn TrackerPlugin>> + Send + Sync>;

/// Named collection of tracker factories.
#[derive(Default)]
pub struct TrackerRegistry {
    factories: BTreeMap<String, TrackerFactory>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in trackers.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("json-prd", |config| {
            let path = config
                .prd_path
                .clone()
                .unwrap_or_else(|| config.cwd.join("prd.json"));
            Ok(Box::new(JsonPrdTracker::new(path)))
        });
        registry.register("markdown", |config| {
            let path = config
                .prd_path
                .clone()
                .unwrap_or_else(|| config.cwd.join("TASKS.md"));
            Ok(Box::new(MarkdownTracker::new(path)))
        });
        registry
    }

    pub fn register<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(&TrackerConfig) -> Result<Box<dyn TrackerPlugin>> + Send + Sync + 'static,
    {
        self.factories.insert(id.to_string(), Box::new(factory));
    }

    /// Instantiate a tracker by id.
    pub fn create(&self, id: &str, config: &TrackerConfig) -> Result<Box<dyn TrackerPlugin>> {
        match self.factories.get(id) {
            Some(factory) => factory(config),
            None => bail!(
                "unknown tracker plugin '{id}' (available: {})",
                self.list().join(", ")
            ),
        }
    }

    /// Registered ids, sorted.
    pub fn list(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }
}

impl std::fmt::Debug for TrackerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerRegistry")
            .field("trackers", &self.list())
            .finish()
    }
}
