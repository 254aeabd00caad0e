//! WebSocket control-plane server.
//!
//! One axum route upgrades to a WebSocket. The first client frame must be
//! an `auth` message carrying the server token; on success the client gets
//! a connection token that every later request must present. Every auth
//! attempt and every authenticated request is written to the audit log
//! before its response is sent. Liveness is an explicit run-loop awaiting
//! a shutdown token, not a promise that never resolves.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog};
use crate::auth::AuthStore;
use crate::protocol::{ClientMessage, error_response, response};

pub const DEFAULT_PORT: u16 = 7890;

/// The in-process surface the server dispatches requests to.
///
/// The CLI implements this over ralph-core; the server itself stays
/// engine-agnostic.
#[async_trait]
pub trait ControlBackend: Send + Sync {
    async fn check_config(&self) -> Result<Value>;
    async fn push_config(&self, config: Value) -> Result<Value>;
    async fn list_sessions(&self) -> Result<Value>;
    async fn start_run(&self, options: Value) -> Result<Value>;
    async fn stop_run(&self, session_id: &str) -> Result<Value>;
    async fn get_session_state(&self, session_id: &str) -> Result<Value>;
    /// Event frames to push to subscribed clients.
    fn subscribe_events(&self) -> broadcast::Receiver<Value>;
}

#[derive(Debug, Clone)]
pub struct RemoteServerConfig {
    pub port: u16,
    /// Explicit bind address; otherwise loopback for a first run and
    /// all-interfaces once a server token is already configured.
    pub bind: Option<IpAddr>,
}

impl Default for RemoteServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: None,
        }
    }
}

/// What a started server looks like.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RemoteServerState {
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

struct Shared {
    auth: Arc<AuthStore>,
    audit: Arc<AuditLog>,
    backend: Arc<dyn ControlBackend>,
}

/// The WebSocket control-plane server.
pub struct RemoteServer {
    shared: Arc<Shared>,
    config: RemoteServerConfig,
    shutdown: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
    state: Option<RemoteServerState>,
}

impl RemoteServer {
    pub fn new(
        auth: Arc<AuthStore>,
        audit: Arc<AuditLog>,
        backend: Arc<dyn ControlBackend>,
        config: RemoteServerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                auth,
                audit,
                backend,
            }),
            config,
            shutdown: CancellationToken::new(),
            handle: None,
            state: None,
        }
    }

    pub fn state(&self) -> Option<&RemoteServerState> {
        self.state.as_ref()
    }

    /// Bind and start serving. Returns once the listener is accepting.
    pub async fn start(&mut self) -> Result<RemoteServerState> {
        let had_token = self.shared.auth.has_server_token();
        self.shared
            .auth
            .get_or_create_server_token()
            .context("failed to load or create server token")?;

        let host = self.config.bind.unwrap_or(if had_token {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });

        let app = Router::new()
            .route("/", get(ws_handler))
            .with_state(Arc::clone(&self.shared));

        let addr = SocketAddr::new(host, self.config.port);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local = listener.local_addr()?;

        // Periodic connection-token sweep while the server lives.
        let sweep_auth = Arc::clone(&self.shared.auth);
        let sweep_cancel = self.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let removed = sweep_auth.cleanup_expired_tokens();
                        if removed > 0 {
                            tracing::debug!(removed, "swept expired connection tokens");
                        }
                    }
                    _ = sweep_cancel.cancelled() => break,
                }
            }
        });

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "remote server exited with error");
            }
        });
        self.handle = Some(handle);

        let state = RemoteServerState {
            host: local.ip().to_string(),
            port: local.port(),
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        tracing::info!(host = %state.host, port = state.port, "remote server listening");
        self.state = Some(state.clone());
        Ok(state)
    }

    /// Close all sockets, revoke connection tokens, and return once the
    /// serve task has exited.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.shared.auth.revoke_all_connections();
        self.state = None;
        tracing::info!("remote server stopped");
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(shared): State<Arc<Shared>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, shared))
}

async fn handle_socket(mut socket: WebSocket, shared: Arc<Shared>) {
    let Some(client_id) = authenticate(&mut socket, &shared).await else {
        return;
    };

    let mut events_rx: Option<broadcast::Receiver<Value>> = None;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket receive error");
                        break;
                    }
                };
                if !handle_request(&mut socket, &shared, &client_id, &text, &mut events_rx).await {
                    break;
                }
            }
            frame = next_event(&mut events_rx) => {
                if let Some(frame) = frame {
                    if send_json(&mut socket, &frame).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    shared.auth.revoke_client(&client_id);
}

/// The first frame must be a valid `auth` message. The attempt is audited
/// either way; on failure the socket is closed after the response.
async fn authenticate(socket: &mut WebSocket, shared: &Shared) -> Option<String> {
    let text = match socket.recv().await {
        Some(Ok(Message::Text(text))) => text.to_string(),
        _ => return None,
    };

    let client_id = Uuid::new_v4().to_string();

    let Ok(ClientMessage::Auth { id, token, .. }) = serde_json::from_str(&text) else {
        audit(shared, &client_id, "auth", false, Some("first message was not auth"));
        let _ = send_json(
            socket,
            &error_response("auth", Uuid::nil(), "first message must be auth"),
        )
        .await;
        let _ = socket.send(Message::Close(None)).await;
        return None;
    };

    if !shared.auth.validate_server_token(&token) {
        audit(shared, &client_id, "auth", false, Some("invalid or expired server token"));
        let _ = send_json(
            socket,
            &error_response("auth", id, "invalid or expired server token"),
        )
        .await;
        let _ = socket.send(Message::Close(None)).await;
        return None;
    }

    let connection = shared.auth.issue_connection_token(&client_id);
    audit(shared, &client_id, "auth", true, None);

    let reply = response(
        "auth",
        id,
        true,
        json!({
            "connection_token": connection.value,
            "expires_at": connection.expires_at,
        }),
    );
    if send_json(socket, &reply).await.is_err() {
        return None;
    }
    Some(client_id)
}

/// Handle one post-handshake frame. Returns `false` when the socket must
/// close.
async fn handle_request(
    socket: &mut WebSocket,
    shared: &Shared,
    client_id: &str,
    text: &str,
    events_rx: &mut Option<broadcast::Receiver<Value>>,
) -> bool {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            let reply = error_response("request", Uuid::nil(), format!("malformed request: {e}"));
            return send_json(socket, &reply).await.is_ok();
        }
    };
    let id = message.id();
    let kind = message.kind();

    // Re-auth on an open socket rotates the connection token.
    if let ClientMessage::Auth { token, .. } = &message {
        if shared.auth.validate_server_token(token) {
            let connection = shared.auth.issue_connection_token(client_id);
            audit(shared, client_id, "auth", true, None);
            let reply = response(
                "auth",
                id,
                true,
                json!({
                    "connection_token": connection.value,
                    "expires_at": connection.expires_at,
                }),
            );
            return send_json(socket, &reply).await.is_ok();
        }
        audit(shared, client_id, "auth", false, Some("invalid or expired server token"));
        let _ = send_json(socket, &error_response("auth", id, "invalid or expired server token"))
            .await;
        return false;
    }

    // Per-request connection-token check.
    let presented = message.connection_token().unwrap_or_default();
    let Some(connection) = shared.auth.validate_connection_token(presented) else {
        audit(shared, client_id, kind, false, Some("invalid or expired connection token"));
        let _ = send_json(
            socket,
            &error_response(kind, id, "invalid or expired connection token"),
        )
        .await;
        return false;
    };

    // Dispatch.
    let outcome = match &message {
        ClientMessage::Auth { .. } => unreachable!("handled above"),
        ClientMessage::CheckConfig { .. } => shared.backend.check_config().await,
        ClientMessage::PushConfig { config, .. } => {
            shared.backend.push_config(config.clone()).await
        }
        ClientMessage::ListSessions { .. } => shared.backend.list_sessions().await,
        ClientMessage::StartRun { options, .. } => {
            shared.backend.start_run(options.clone()).await
        }
        ClientMessage::StopRun { session_id, .. } => shared.backend.stop_run(session_id).await,
        ClientMessage::GetSessionState { session_id, .. } => {
            shared.backend.get_session_state(session_id).await
        }
        ClientMessage::StreamEvents { .. } => {
            *events_rx = Some(shared.backend.subscribe_events());
            Ok(json!({ "streaming": true }))
        }
    };

    let mut reply = match &outcome {
        Ok(extra) => response(kind, id, true, extra.clone()),
        Err(e) => error_response(kind, id, format!("{e:#}")),
    };

    // Rotate the connection token when it is close to expiry.
    if let Some(rotated) = shared.auth.refresh_if_needed(&connection) {
        if let Value::Object(reply) = &mut reply {
            reply.insert("connection_token".to_string(), json!(rotated.value));
            reply.insert("expires_at".to_string(), json!(rotated.expires_at));
        }
    }

    // Audited before the response goes out.
    audit(
        shared,
        client_id,
        kind,
        outcome.is_ok(),
        outcome.as_ref().err().map(|e| format!("{e:#}")).as_deref(),
    );

    send_json(socket, &reply).await.is_ok()
}

async fn next_event(rx: &mut Option<broadcast::Receiver<Value>>) -> Option<Value> {
    match rx {
        Some(receiver) => match receiver.recv().await {
            Ok(frame) => Some(frame),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event stream lagged, frames dropped");
                None
            }
            Err(broadcast::error::RecvError::Closed) => {
                *rx = None;
                None
            }
        },
        None => std::future::pending().await,
    }
}

async fn send_json(socket: &mut WebSocket, value: &Value) -> Result<()> {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .context("failed to send websocket frame")
}

fn audit(shared: &Shared, client_id: &str, action: &str, success: bool, error: Option<&str>) {
    let mut entry = AuditEntry::new(client_id, action, success);
    if let Some(error) = error {
        entry = entry.with_error(error);
    }
    if let Err(e) = shared.audit.append(&entry) {
        tracing::warn!(error = %e, "failed to write audit entry");
    }
}
