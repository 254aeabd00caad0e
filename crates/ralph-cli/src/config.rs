//! User-level configuration paths.
//!
//! Always XDG layout: `$XDG_CONFIG_HOME/ralph` or `~/.config/ralph`. The
//! platform-specific `dirs::config_dir()` is intentionally ignored (it
//! points at `~/Library/Application Support` on macOS, which is hostile to
//! hand-editing).

use std::path::PathBuf;

/// Return the ralph user config directory.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("ralph");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("ralph")
}

/// Whether this process was forked by the listen-command daemonizer.
pub fn is_daemon_child() -> bool {
    std::env::var("RALPH_DAEMON").as_deref() == Ok("1")
}
