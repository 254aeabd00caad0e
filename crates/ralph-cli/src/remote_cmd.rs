//! `ralph remote`: manage the saved remote address book and talk to
//! remote control planes.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::json;

use ralph_remote::{RemoteClient, RemoteEntry, RemotesFile};

use crate::config;

#[derive(Debug, Subcommand)]
pub enum RemoteCommands {
    /// Save a remote address and its server token
    Add {
        name: String,
        /// ws://host:port/ address
        url: String,
        /// Server token issued by `ralph listen` on the remote host
        token: String,
    },
    /// List saved remotes
    List,
    /// Forget a saved remote
    Remove { name: String },
    /// Authenticate against a remote and list its sessions
    Test { name: String },
    /// Push the local plugin configuration to a remote
    PushConfig { name: String },
}

pub async fn run(command: RemoteCommands) -> Result<()> {
    let remotes = RemotesFile::in_config_dir(&config::config_dir());

    match command {
        RemoteCommands::Add { name, url, token } => {
            remotes.add(&RemoteEntry { name: name.clone(), url, token })?;
            println!("saved remote '{name}'");
        }

        RemoteCommands::List => {
            let entries = remotes.list()?;
            if entries.is_empty() {
                println!("no remotes saved; add one with `ralph remote add`");
            }
            for entry in entries {
                println!("{}  {}", entry.name, entry.url);
            }
        }

        RemoteCommands::Remove { name } => {
            if remotes.remove(&name)? {
                println!("removed remote '{name}'");
            } else {
                println!("no remote named '{name}'");
            }
        }

        RemoteCommands::Test { name } => {
            let entry = find(&remotes, &name)?;
            let mut client = RemoteClient::connect(&entry.url).await?;
            client.authenticate(&entry.token).await?;

            let reply = client.list_sessions().await?;
            let count = reply["sessions"].as_array().map(Vec::len).unwrap_or(0);
            println!("{name}: auth ok, {count} session(s)");
            client.close().await;
        }

        RemoteCommands::PushConfig { name } => {
            let entry = find(&remotes, &name)?;
            let mut client = RemoteClient::connect(&entry.url).await?;
            client.authenticate(&entry.token).await?;

            let payload = json!({
                "pushed_from": std::env::current_dir().ok(),
                "agents": ralph_core::agent::AgentRegistry::builtin().list(),
                "trackers": ralph_core::tracker::TrackerRegistry::builtin().list(),
            });
            let reply = client.push_config(payload).await?;
            if reply["success"] == json!(true) {
                println!("config pushed to {name}");
            } else {
                println!(
                    "push failed: {}",
                    reply["error"].as_str().unwrap_or("unknown error")
                );
            }
            client.close().await;
        }
    }
    Ok(())
}

fn find(remotes: &RemotesFile, name: &str) -> Result<RemoteEntry> {
    remotes
        .find(name)?
        .with_context(|| format!("no remote named '{name}'; see `ralph remote list`"))
}
