//! Append-only JSONL audit trail.
//!
//! One JSON object per line in `<user_config_dir>/audit.log`. When the
//! file outgrows the size limit it is renamed aside (keeping at most five
//! rotated files) and a fresh one starts. Reads are reverse-chronological
//! and skip malformed lines silently.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_ROTATED: usize = 5;

/// One audited action. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AuditEntry {
    pub fn new(client_id: impl Into<String>, action: impl Into<String>, success: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            client_id: client_id.into(),
            action: action.into(),
            success,
            error: None,
            details: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Handle on the audit log file.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    max_bytes: u64,
    max_rotated: usize,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            max_bytes: DEFAULT_MAX_BYTES,
            max_rotated: DEFAULT_MAX_ROTATED,
        }
    }

    pub fn in_config_dir(config_dir: &Path) -> Self {
        Self::new(config_dir.join("audit.log"))
    }

    pub fn with_limits(path: PathBuf, max_bytes: u64, max_rotated: usize) -> Self {
        Self {
            path,
            max_bytes,
            max_rotated,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry, rotating first if the file is over the limit.
    pub fn append(&self, entry: &AuditEntry) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.rotate_if_needed()?;

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }

    /// The most recent `n` entries, newest first. Malformed lines are
    /// skipped silently.
    pub fn read_recent(&self, n: usize) -> Vec<AuditEntry> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        contents
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(n)
            .collect()
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let Ok(metadata) = std::fs::metadata(&self.path) else {
            return Ok(());
        };
        if metadata.len() <= self.max_bytes {
            return Ok(());
        }

        let rotated = self
            .path
            .with_extension(format!("log.{}", Utc::now().timestamp_millis()));
        std::fs::rename(&self.path, &rotated)?;
        tracing::info!(rotated = %rotated.display(), "rotated audit log");

        self.prune_rotated()
    }

    fn prune_rotated(&self) -> std::io::Result<()> {
        let Some(parent) = self.path.parent() else {
            return Ok(());
        };
        let Some(file_name) = self.path.file_name().and_then(|n| n.to_str()) else {
            return Ok(());
        };
        let prefix = format!("{file_name}.");

        let mut rotated: Vec<PathBuf> = std::fs::read_dir(parent)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix))
            })
            .collect();

        // Timestamp suffixes sort lexicographically; oldest first.
        rotated.sort();
        while rotated.len() > self.max_rotated {
            let oldest = rotated.remove(0);
            tracing::info!(path = %oldest.display(), "pruning old audit log");
            std::fs::remove_file(oldest)?;
        }
        Ok(())
    }
}
