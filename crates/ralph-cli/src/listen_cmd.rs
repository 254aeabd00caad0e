//! `ralph listen`: run the remote control-plane server, optionally as a
//! forked daemon, and wire its dispatch surface to ralph-core.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use ralph_core::agent::{AgentConfig, AgentRegistry};
use ralph_core::session::registry::SessionRegistry;
use ralph_core::session::state;
use ralph_core::tracker::TrackerRegistry;
use ralph_core::{Engine, RunConfig};
use ralph_remote::protocol::event_frame;
use ralph_remote::{AuditLog, AuthStore, ControlBackend, RemoteServer, RemoteServerConfig};

use crate::config;

#[derive(Debug, Args)]
pub struct ListenArgs {
    /// Port to listen on
    #[arg(long, default_value_t = ralph_remote::server::DEFAULT_PORT)]
    pub port: u16,

    /// Explicit bind address (overrides the token-based default)
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Fork into the background and return immediately
    #[arg(long)]
    pub daemon: bool,

    /// Rotate the server token before starting
    #[arg(long)]
    pub rotate_token: bool,
}

pub async fn run(cwd: PathBuf, args: ListenArgs) -> Result<()> {
    let config_dir = config::config_dir();
    let auth = Arc::new(AuthStore::in_config_dir(&config_dir));

    if args.rotate_token {
        let token = auth.rotate_server_token()?;
        println!("server token rotated (version {})", token.version);
        println!("{}", token.value);
    }

    if args.daemon && !config::is_daemon_child() {
        return fork_daemon();
    }
    let quiet = config::is_daemon_child();

    let audit = Arc::new(AuditLog::in_config_dir(&config_dir));
    let backend = Arc::new(CoreBackend::new(cwd, config_dir));
    let mut server = RemoteServer::new(
        Arc::clone(&auth),
        audit,
        backend,
        RemoteServerConfig {
            port: args.port,
            bind: args.bind,
        },
    );

    let state = server.start().await?;
    if !quiet {
        let token = auth.get_or_create_server_token()?;
        println!("listening on ws://{}:{}/ (pid {})", state.host, state.port, state.pid);
        println!(
            "server token (v{}): {}…",
            token.version,
            &token.value[..token.value.len().min(16)]
        );
        println!("press Ctrl-C to stop");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;
    server.stop().await;
    Ok(())
}

/// Re-exec ourselves detached, with `RALPH_DAEMON=1` so the child
/// suppresses interactive stdout.
fn fork_daemon() -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    let child = std::process::Command::new(exe)
        .args(&args)
        .env("RALPH_DAEMON", "1")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("failed to fork listen daemon")?;

    println!("listen daemon started (pid {})", child.id());
    Ok(())
}

/// The in-process dispatch surface behind the WebSocket server.
pub struct CoreBackend {
    workspace: PathBuf,
    config_dir: PathBuf,
    events: broadcast::Sender<Value>,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl CoreBackend {
    pub fn new(workspace: PathBuf, config_dir: PathBuf) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            workspace,
            config_dir,
            events,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> SessionRegistry {
        SessionRegistry::in_config_dir(&self.config_dir)
    }
}

#[async_trait]
impl ControlBackend for CoreBackend {
    async fn check_config(&self) -> Result<Value> {
        Ok(json!({
            "workspace": self.workspace,
            "config_dir": self.config_dir,
            "agents": AgentRegistry::builtin().list(),
            "trackers": TrackerRegistry::builtin().list(),
        }))
    }

    async fn push_config(&self, config: Value) -> Result<Value> {
        let path = self.config_dir.join("remote-config.json");
        std::fs::create_dir_all(&self.config_dir)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&config)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(json!({ "saved": true, "path": path }))
    }

    async fn list_sessions(&self) -> Result<Value> {
        Ok(json!({ "sessions": self.registry().list() }))
    }

    async fn start_run(&self, options: Value) -> Result<Value> {
        let session_id = uuid::Uuid::new_v4().to_string();

        let mut config = RunConfig::new(self.workspace.clone());
        config.session_id = Some(session_id.clone());
        config.user_config_dir = Some(self.config_dir.clone());
        if let Some(agent) = options.get("agent").and_then(Value::as_str) {
            config.agent = agent.to_string();
        }
        if let Some(tracker) = options.get("tracker").and_then(Value::as_str) {
            config.tracker = tracker.to_string();
        }
        if let Some(model) = options.get("model").and_then(Value::as_str) {
            config.agent_config = AgentConfig {
                model: Some(model.to_string()),
                ..Default::default()
            };
        }
        if let Some(prd) = options.get("prd").and_then(Value::as_str) {
            config.prd_path = Some(PathBuf::from(prd));
        }
        if let Some(iterations) = options.get("iterations").and_then(Value::as_u64) {
            config.max_iterations = iterations as u32;
        }

        let agents = AgentRegistry::builtin();
        let trackers = TrackerRegistry::builtin();
        let mut engine = Engine::new(config, &agents, &trackers)?;

        // Forward engine events to subscribed sockets.
        let events = self.events.clone();
        let event_session = session_id.clone();
        engine.subscribe(move |event| {
            if let Ok(payload) = serde_json::to_value(event) {
                let kind = payload
                    .get("event")
                    .and_then(Value::as_str)
                    .unwrap_or("engine")
                    .to_string();
                let _ = events.send(event_frame(&kind, Some(&event_session), payload));
            }
        });

        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.clone(), engine.cancel_token());

        let done_events = self.events.clone();
        let done_session = session_id.clone();
        tokio::spawn(async move {
            match engine.run().await {
                Ok(outcome) => {
                    tracing::info!(session_id = %done_session, reason = ?outcome.reason, "remote run finished");
                }
                Err(e) => {
                    tracing::warn!(session_id = %done_session, error = %e, "remote run failed");
                    let _ = done_events.send(event_frame(
                        "engine_error",
                        Some(&done_session),
                        json!({ "error": format!("{e:#}") }),
                    ));
                }
            }
        });

        Ok(json!({ "session_id": session_id }))
    }

    async fn stop_run(&self, session_id: &str) -> Result<Value> {
        let stopped = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id)
            .map(|cancel| {
                cancel.cancel();
                true
            })
            .unwrap_or(false);
        Ok(json!({ "stopped": stopped }))
    }

    async fn get_session_state(&self, session_id: &str) -> Result<Value> {
        // The registry maps the id to its workspace; the state file has the
        // full picture.
        let entry = self
            .registry()
            .find(session_id)
            .with_context(|| format!("unknown session {session_id}"))?;
        let session = state::load(&entry.cwd);
        Ok(json!({ "entry": entry, "state": session }))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<Value> {
        self.events.subscribe()
    }
}
