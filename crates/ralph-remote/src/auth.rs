//! Two-tier token store.
//!
//! The long-lived server token is persisted to `remote.json` (0600 on
//! Unix) and proves a client may talk to this control plane at all.
//! Short-lived connection tokens are issued per authenticated client and
//! live only in memory. All comparisons are constant-time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

pub const SERVER_TOKEN_LIFETIME_DAYS: i64 = 90;
pub const CONNECTION_TOKEN_LIFETIME_HOURS: i64 = 24;
/// A connection token this close to expiry gets rotated on the next
/// response.
pub const REFRESH_THRESHOLD_SECS: i64 = 3600;

/// Long-lived secret persisted to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerToken {
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: u32,
}

impl ServerToken {
    fn generate(version: u32) -> Self {
        let now = Utc::now();
        Self {
            value: format!("ralph_st_{}", random_hex()),
            created_at: now,
            expires_at: now + Duration::days(SERVER_TOKEN_LIFETIME_DAYS),
            version,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Short-lived, in-memory-only secret issued after server-token auth.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionToken {
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub client_id: String,
}

impl ConnectionToken {
    fn generate(client_id: &str) -> Self {
        let now = Utc::now();
        Self {
            value: format!("ralph_ct_{}", random_hex()),
            created_at: now,
            expires_at: now + Duration::hours(CONNECTION_TOKEN_LIFETIME_HOURS),
            client_id: client_id.to_string(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn needs_refresh(&self) -> bool {
        (self.expires_at - Utc::now()).num_seconds() <= REFRESH_THRESHOLD_SECS
    }
}

/// On-disk shape of `remote.json`.
#[derive(Debug, Serialize, Deserialize, Default)]
struct RemoteFile {
    server_token: Option<ServerToken>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    migrated_from_legacy: bool,
}

/// Pre-versioning single-token format, migrated on first read.
#[derive(Debug, Deserialize)]
struct LegacyRemoteFile {
    token: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Token store: one persisted server token, in-memory connection tokens.
pub struct AuthStore {
    path: PathBuf,
    connections: Mutex<HashMap<String, ConnectionToken>>,
}

impl AuthStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_config_dir(config_dir: &Path) -> Self {
        Self::new(config_dir.join("remote.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a server token file exists at all (expired or not).
    pub fn has_server_token(&self) -> bool {
        self.load_server_token().is_some()
    }

    /// Read the persisted server token, migrating a legacy file in place.
    pub fn load_server_token(&self) -> Option<ServerToken> {
        let contents = std::fs::read_to_string(&self.path).ok()?;

        if let Ok(file) = serde_json::from_str::<RemoteFile>(&contents) {
            if let Some(token) = file.server_token {
                return Some(token);
            }
        }

        let legacy = serde_json::from_str::<LegacyRemoteFile>(&contents).ok()?;
        let token = ServerToken {
            value: legacy.token,
            created_at: legacy.created_at,
            expires_at: legacy.expires_at,
            version: 1,
        };
        tracing::info!(path = %self.path.display(), "migrating legacy remote token file");
        if let Err(e) = self.store(&token, true) {
            tracing::warn!(error = %e, "failed to rewrite migrated token file");
        }
        Some(token)
    }

    /// Return the current server token, generating or regenerating as
    /// needed. Idempotent while the token is unexpired.
    pub fn get_or_create_server_token(&self) -> std::io::Result<ServerToken> {
        match self.load_server_token() {
            Some(token) if !token.is_expired() => Ok(token),
            Some(expired) => {
                let token = ServerToken::generate(expired.version + 1);
                self.store(&token, false)?;
                Ok(token)
            }
            None => {
                let token = ServerToken::generate(1);
                self.store(&token, false)?;
                Ok(token)
            }
        }
    }

    /// Unconditionally issue a new server token value.
    pub fn rotate_server_token(&self) -> std::io::Result<ServerToken> {
        let version = self
            .load_server_token()
            .map(|t| t.version + 1)
            .unwrap_or(1);
        let token = ServerToken::generate(version);
        self.store(&token, false)?;
        Ok(token)
    }

    /// Constant-time check of a presented server token.
    pub fn validate_server_token(&self, presented: &str) -> bool {
        let Some(token) = self.load_server_token() else {
            return false;
        };
        if token.is_expired() {
            return false;
        }
        constant_time_eq(token.value.as_bytes(), presented.as_bytes())
    }

    /// Issue a connection token for a client, revoking any prior token the
    /// same client held.
    pub fn issue_connection_token(&self, client_id: &str) -> ConnectionToken {
        let token = ConnectionToken::generate(client_id);
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.retain(|_, t| t.client_id != client_id);
        connections.insert(token.value.clone(), token.clone());
        token
    }

    /// Look up a presented connection token; expired tokens are dropped.
    pub fn validate_connection_token(&self, presented: &str) -> Option<ConnectionToken> {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());

        let matched = connections
            .values()
            .find(|t| constant_time_eq(t.value.as_bytes(), presented.as_bytes()))
            .cloned()?;

        if matched.is_expired() {
            connections.remove(&matched.value);
            return None;
        }
        Some(matched)
    }

    /// Rotate a token that is inside the refresh window.
    pub fn refresh_if_needed(&self, token: &ConnectionToken) -> Option<ConnectionToken> {
        token
            .needs_refresh()
            .then(|| self.issue_connection_token(&token.client_id))
    }

    pub fn revoke_client(&self, client_id: &str) {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, t| t.client_id != client_id);
    }

    pub fn revoke_all_connections(&self) {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Drop expired tokens; returns how many were removed. Run at least
    /// once a minute while the server is up.
    pub fn cleanup_expired_tokens(&self) -> usize {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        let before = connections.len();
        connections.retain(|_, t| !t.is_expired());
        before - connections.len()
    }

    pub fn active_connections(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn store(&self, token: &ServerToken, migrated: bool) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = RemoteFile {
            server_token: Some(token.clone()),
            migrated_from_legacy: migrated,
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp, &self.path)
    }
}

fn random_hex() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time byte comparison.
///
/// Unequal-length inputs still do length-of-`b` XOR work before returning
/// false, so timing does not reveal the match prefix or the length check.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = 0u8;
    for (i, byte) in b.iter().enumerate() {
        diff |= byte ^ a.get(i).copied().unwrap_or(0);
    }
    let bytes_equal = diff.ct_eq(&0u8);
    let lengths_equal = (a.len() as u64).ct_eq(&(b.len() as u64));
    (bytes_equal & lengths_equal).into()
}
