//! Agent registry -- a compile-time-registered table of adapter factories.
//!
//! Replaces dynamic-module plugin loading: every supported agent is
//! registered here at build time, and the engine re-creates instances from
//! factories (e.g. on resume) rather than sharing mutable singletons.

use std::collections::BTreeMap;

use anyhow::{Result, bail};

use super::trait_def::AgentPlugin;
use super::types::AgentConfig;
use super::{ClaudeAgent, DroidAgent, OpencodeAgent, TestAgent};

type AgentFactory = Box<dyn Fn(&AgentConfig) -> Result<Box<dyn AgentPlugin>> + Send + Sync>;

/// Named collection of agent adapter factories.
#[derive(Default)]
pub struct AgentRegistry {
    factories: BTreeMap<String, AgentFactory>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in adapters.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("claude", |config| Ok(Box::new(ClaudeAgent::new(config))));
        registry.register("opencode", |config| Ok(Box::new(OpencodeAgent::new(config))));
        registry.register("droid", |config| Ok(Box::new(DroidAgent::new(config))));
        registry.register("test", |config| Ok(Box::new(TestAgent::new(config))));
        registry
    }

    pub fn register<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(&AgentConfig) -> Result<Box<dyn AgentPlugin>> + Send + Sync + 'static,
    {
        self.factories.insert(id.to_string(), Box::new(factory));
    }

    /// Instantiate an adapter by id.
    pub fn create(&self, id: &str, config: &AgentConfig) -> Result<Box<dyn AgentPlugin>> {
        match self.factories.get(id) {
            Some(factory) => factory(config),
            None => bail!(
                "unknown agent plugin '{id}' (available: {})",
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

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registers_expected_agents() {
        let registry = AgentRegistry::builtin();
        assert_eq!(registry.list(), vec!["claude", "droid", "opencode", "test"]);
    }

    #[test]
    fn create_passes_config_through() {
        let registry = AgentRegistry::builtin();
        let agent = registry
            .create(
                "test",
                &AgentConfig {
                    command: Some("/bin/cat".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(agent.meta().id, "test");
    }

    #[test]
    fn unknown_agent_names_the_alternatives() {
        let registry = AgentRegistry::builtin();
        let err = registry
            .create("cursor", &AgentConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("claude"));
    }

    #[test]
    fn custom_registration_wins_lookup() {
        let mut registry = AgentRegistry::new();
        registry.register("test", |config| Ok(Box::new(TestAgent::new(config))));
        assert!(registry.contains("test"));
        assert!(!registry.contains("claude"));
    }
}
