//! Wire protocol for the remote control plane.
//!
//! Every frame is a single complete JSON envelope over a WebSocket text
//! message. Requests carry `type`, `id`, `timestamp`, and (after the
//! handshake) a `connection_token`; responses echo the request id as
//! `{ type: "<kind>_response", id, success, ... }`. Server pushes use
//! `{ type: "event", kind, session_id?, payload }`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// The closed set of request kinds a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        id: Uuid,
        timestamp: DateTime<Utc>,
        token: String,
    },
    CheckConfig {
        id: Uuid,
        timestamp: DateTime<Utc>,
        connection_token: String,
    },
    PushConfig {
        id: Uuid,
        timestamp: DateTime<Utc>,
        connection_token: String,
        config: Value,
    },
    ListSessions {
        id: Uuid,
        timestamp: DateTime<Utc>,
        connection_token: String,
    },
    StartRun {
        id: Uuid,
        timestamp: DateTime<Utc>,
        connection_token: String,
        #[serde(default)]
        options: Value,
    },
    StopRun {
        id: Uuid,
        timestamp: DateTime<Utc>,
        connection_token: String,
        session_id: String,
    },
    GetSessionState {
        id: Uuid,
        timestamp: DateTime<Utc>,
        connection_token: String,
        session_id: String,
    },
    StreamEvents {
        id: Uuid,
        timestamp: DateTime<Utc>,
        connection_token: String,
        #[serde(default)]
        session_id: Option<String>,
    },
}

impl ClientMessage {
    pub fn id(&self) -> Uuid {
        match self {
            ClientMessage::Auth { id, .. }
            | ClientMessage::CheckConfig { id, .. }
            | ClientMessage::PushConfig { id, .. }
            | ClientMessage::ListSessions { id, .. }
            | ClientMessage::StartRun { id, .. }
            | ClientMessage::StopRun { id, .. }
            | ClientMessage::GetSessionState { id, .. }
            | ClientMessage::StreamEvents { id, .. } => *id,
        }
    }

    /// The request kind, as used in audit entries and response types.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => "auth",
            ClientMessage::CheckConfig { .. } => "check_config",
            ClientMessage::PushConfig { .. } => "push_config",
            ClientMessage::ListSessions { .. } => "list_sessions",
            ClientMessage::StartRun { .. } => "start_run",
            ClientMessage::StopRun { .. } => "stop_run",
            ClientMessage::GetSessionState { .. } => "get_session_state",
            ClientMessage::StreamEvents { .. } => "stream_events",
        }
    }

    /// The presented connection token; `None` for the handshake itself.
    pub fn connection_token(&self) -> Option<&str> {
        match self {
            ClientMessage::Auth { .. } => None,
            ClientMessage::CheckConfig {
                connection_token, ..
            }
            | ClientMessage::PushConfig {
                connection_token, ..
            }
            | ClientMessage::ListSessions {
                connection_token, ..
            }
            | ClientMessage::StartRun {
                connection_token, ..
            }
            | ClientMessage::StopRun {
                connection_token, ..
            }
            | ClientMessage::GetSessionState {
                connection_token, ..
            }
            | ClientMessage::StreamEvents {
                connection_token, ..
            } => Some(connection_token),
        }
    }
}

/// Build a `<kind>_response` envelope. `extra` must be a JSON object; its
/// fields are merged into the envelope.
pub fn response(kind: &str, id: Uuid, success: bool, extra: Value) -> Value {
    let mut envelope = json!({
        "type": format!("{kind}_response"),
        "id": id,
        "success": success,
    });
    if let (Value::Object(envelope), Value::Object(extra)) = (&mut envelope, extra) {
        for (key, value) in extra {
            envelope.insert(key, value);
        }
    }
    envelope
}

/// Build a failure response with an error message.
pub fn error_response(kind: &str, id: Uuid, error: impl Into<String>) -> Value {
    response(kind, id, false, json!({ "error": error.into() }))
}

/// Build a server-push event frame.
pub fn event_frame(kind: &str, session_id: Option<&str>, payload: Value) -> Value {
    let mut frame = json!({
        "type": "event",
        "kind": kind,
        "payload": payload,
    });
    if let (Value::Object(frame), Some(session_id)) = (&mut frame, session_id) {
        frame.insert("session_id".to_string(), json!(session_id));
    }
    frame
}
