//! WebSocket client used by the `ralph remote` subcommands.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

/// A connected (and, after [`authenticate`], authorized) control-plane
/// client.
///
/// [`authenticate`]: RemoteClient::authenticate
pub struct RemoteClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    connection_token: Option<String>,
}

impl RemoteClient {
    /// Open the socket. `url` is a `ws://host:port/` address.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        Ok(Self {
            ws,
            connection_token: None,
        })
    }

    /// Perform the auth handshake and store the issued connection token.
    pub async fn authenticate(&mut self, server_token: &str) -> Result<Value> {
        let request = json!({
            "type": "auth",
            "id": Uuid::new_v4(),
            "timestamp": Utc::now(),
            "token": server_token,
        });
        let reply = self.round_trip(request).await?;

        if reply["success"] != json!(true) {
            bail!(
                "authentication rejected: {}",
                reply["error"].as_str().unwrap_or("unknown error")
            );
        }
        let token = reply["connection_token"]
            .as_str()
            .context("auth response carried no connection token")?;
        self.connection_token = Some(token.to_string());
        Ok(reply)
    }

    /// Send one request of the given kind with extra fields, await its
    /// response, and absorb any rotated connection token.
    pub async fn request(&mut self, kind: &str, extra: Value) -> Result<Value> {
        let token = self
            .connection_token
            .clone()
            .context("not authenticated; call authenticate first")?;

        let mut request = json!({
            "type": kind,
            "id": Uuid::new_v4(),
            "timestamp": Utc::now(),
            "connection_token": token,
        });
        if let (Value::Object(request), Value::Object(extra)) = (&mut request, extra) {
            for (key, value) in extra {
                request.insert(key, value);
            }
        }

        let reply = self.round_trip(request).await?;
        if let Some(rotated) = reply["connection_token"].as_str() {
            self.connection_token = Some(rotated.to_string());
        }
        Ok(reply)
    }

    pub async fn check_config(&mut self) -> Result<Value> {
        self.request("check_config", json!({})).await
    }

    pub async fn push_config(&mut self, config: Value) -> Result<Value> {
        self.request("push_config", json!({ "config": config })).await
    }

    pub async fn list_sessions(&mut self) -> Result<Value> {
        self.request("list_sessions", json!({})).await
    }

    pub async fn start_run(&mut self, options: Value) -> Result<Value> {
        self.request("start_run", json!({ "options": options })).await
    }

    pub async fn stop_run(&mut self, session_id: &str) -> Result<Value> {
        self.request("stop_run", json!({ "session_id": session_id }))
            .await
    }

    pub async fn get_session_state(&mut self, session_id: &str) -> Result<Value> {
        self.request("get_session_state", json!({ "session_id": session_id }))
            .await
    }

    /// Subscribe to server pushes, then read event frames with
    /// [`next_frame`].
    ///
    /// [`next_frame`]: RemoteClient::next_frame
    pub async fn stream_events(&mut self, session_id: Option<&str>) -> Result<Value> {
        let extra = match session_id {
            Some(session_id) => json!({ "session_id": session_id }),
            None => json!({}),
        };
        self.request("stream_events", extra).await
    }

    /// The next JSON frame of any type (response or event push).
    pub async fn next_frame(&mut self) -> Result<Value> {
        loop {
            let message = self
                .ws
                .next()
                .await
                .context("connection closed")?
                .context("websocket read failed")?;
            match message {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str())
                        .context("server sent malformed JSON");
                }
                Message::Close(_) => bail!("server closed the connection"),
                _ => continue,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }

    async fn round_trip(&mut self, request: Value) -> Result<Value> {
        self.ws
            .send(Message::text(request.to_string()))
            .await
            .context("failed to send request")?;
        self.next_frame().await
    }
}
