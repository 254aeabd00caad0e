//! `ralph status`: workspace session state plus the cross-workspace
//! registry.

use std::path::Path;

use anyhow::Result;

use ralph_core::session::lock;
use ralph_core::session::registry::SessionRegistry;
use ralph_core::session::state;

use crate::config;

pub fn run(cwd: &Path) -> Result<()> {
    println!("workspace: {}", cwd.display());

    match lock::read_lock(cwd) {
        Some(info) => {
            let stale = lock::is_stale(&info);
            println!(
                "lock: held by pid {} (session {}, acquired {}){}",
                info.pid,
                info.session_id,
                info.acquired_at.format("%Y-%m-%d %H:%M:%S UTC"),
                if stale { " [stale]" } else { "" }
            );
        }
        None => println!("lock: free"),
    }

    match state::load(cwd) {
        Some(session) => {
            println!(
                "session {}: {} · iteration {} · {}/{} tasks completed",
                session.session_id,
                session.status,
                session.current_iteration,
                session.tasks_completed(),
                session.tasks.len(),
            );
            for task in &session.tasks {
                let mark = if task.completed { "x" } else { " " };
                println!("  [{mark}] {}: {}", task.id, task.title);
            }
            if let Some(last) = session.iteration_history.last() {
                println!(
                    "last iteration: #{} on {} ({})",
                    last.iteration,
                    last.task_id,
                    if last.success { "ok" } else { "failed" },
                );
            }
            if session.is_resumable() {
                println!("resumable: yes (`ralph resume`)");
            }
        }
        None => println!("session: none saved"),
    }

    let registry = SessionRegistry::in_config_dir(&config::config_dir());
    let others: Vec<_> = registry
        .list()
        .into_iter()
        .filter(|entry| entry.cwd != cwd)
        .collect();
    if !others.is_empty() {
        println!("\nother workspaces:");
        for entry in others {
            println!(
                "  {} · {} · {}",
                entry.session_id,
                entry.status,
                entry.cwd.display()
            );
        }
    }

    Ok(())
}
