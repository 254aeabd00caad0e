//! `ralph plugins`: list registered agent and tracker plugins.

use anyhow::Result;
use clap::Subcommand;

use ralph_core::agent::{AgentConfig, AgentPlugin, AgentRegistry};
use ralph_core::tracker::{TrackerConfig, TrackerPlugin, TrackerRegistry};

#[derive(Debug, Subcommand)]
pub enum PluginsCommands {
    /// List agent adapters and whether each is installed
    Agents,
    /// List tracker backends
    Trackers,
}

pub async fn run(command: PluginsCommands) -> Result<()> {
    match command {
        PluginsCommands::Agents => {
            let registry = AgentRegistry::builtin();
            for id in registry.list() {
                let agent = registry.create(&id, &AgentConfig::default())?;
                let meta = agent.meta();
                let detect = agent.detect().await;
                let installed = if detect.available {
                    detect.version.unwrap_or_else(|| "installed".to_string())
                } else {
                    "not installed".to_string()
                };
                println!(
                    "{:<10} {:<14} command={:<10} streaming={} subagents={} [{}]",
                    meta.id,
                    meta.name,
                    meta.default_command,
                    meta.supports_streaming,
                    meta.supports_subagent_tracing,
                    installed,
                );
            }
        }
        PluginsCommands::Trackers => {
            let registry = TrackerRegistry::builtin();
            for id in registry.list() {
                let tracker = registry.create(&id, &TrackerConfig::default())?;
                let meta = tracker.meta();
                println!(
                    "{:<10} {:<20} sync={} hierarchy={} dependencies={}",
                    meta.id,
                    meta.name,
                    meta.supports_bidirectional_sync,
                    meta.supports_hierarchy,
                    meta.supports_dependencies,
                );
            }
        }
    }
    Ok(())
}
