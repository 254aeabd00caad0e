//! `ralph config`: inspect resolved configuration and file locations.

use std::path::Path;

use anyhow::Result;
use clap::Subcommand;

use ralph_core::session::session_dir;
use ralph_remote::{AuthStore, RemotesFile};

use crate::config;

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show resolved paths and token status
    Show,
}

pub fn run(cwd: &Path, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config_dir = config::config_dir();
            println!("workspace:        {}", cwd.display());
            println!("session dir:      {}", session_dir(cwd).display());
            println!("config dir:       {}", config_dir.display());
            println!("session registry: {}", config_dir.join("sessions.json").display());
            println!("audit log:        {}", config_dir.join("audit.log").display());

            let auth = AuthStore::in_config_dir(&config_dir);
            match auth.load_server_token() {
                Some(token) => println!(
                    "server token:     v{} expires {}{}",
                    token.version,
                    token.expires_at.format("%Y-%m-%d"),
                    if token.is_expired() { " [expired]" } else { "" },
                ),
                None => println!("server token:     none (created on first `ralph listen`)"),
            }

            let remotes = RemotesFile::in_config_dir(&config_dir);
            let count = remotes.list().map(|r| r.len()).unwrap_or(0);
            println!("remotes:          {count} saved ({})", remotes.path().display());
        }
    }
    Ok(())
}
