mod config;
mod config_cmd;
mod listen_cmd;
mod plugins_cmd;
mod remote_cmd;
mod run_cmd;
mod status_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ralph_core::EngineError;
use ralph_core::session::lock::LockError;

#[derive(Parser)]
#[command(name = "ralph", about = "Autonomous loop driver for LLM coding agents", version)]
struct Cli {
    /// Workspace directory (defaults to the current directory)
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the iteration loop until tasks are done
    Run(run_cmd::RunArgs),
    /// Resume an interrupted or paused session
    Resume(run_cmd::ResumeArgs),
    /// Show the session status for this workspace
    Status,
    /// Start the remote control-plane server
    Listen(listen_cmd::ListenArgs),
    /// Manage saved remote control planes
    Remote {
        #[command(subcommand)]
        command: remote_cmd::RemoteCommands,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: config_cmd::ConfigCommands,
    },
    /// List available plugins
    Plugins {
        #[command(subcommand)]
        command: plugins_cmd::PluginsCommands,
    },
}

// Exit codes: 0 success, 1 usage or runtime error, 2 configuration error,
// 3 lock conflict, 4 preflight failure.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(engine_err) = err.downcast_ref::<EngineError>() {
        return match engine_err {
            EngineError::Config(_) => 2,
            EngineError::Preflight { .. } => 4,
            EngineError::Lock(LockError::Held { .. }) => 3,
            _ => 1,
        };
    }
    if err.downcast_ref::<LockError>().is_some() {
        return 3;
    }
    1
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RALPH_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let result = match cli.command {
        Commands::Run(args) => run_cmd::run(cwd, args).await,
        Commands::Resume(args) => run_cmd::resume(cwd, args).await,
        Commands::Status => status_cmd::run(&cwd),
        Commands::Listen(args) => listen_cmd::run(cwd, args).await,
        Commands::Remote { command } => remote_cmd::run(command).await,
        Commands::Config { command } => config_cmd::run(&cwd, command),
        Commands::Plugins { command } => plugins_cmd::run(command).await,
    };

    match result {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}
