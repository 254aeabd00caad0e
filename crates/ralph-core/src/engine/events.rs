//! Engine event bus.
//!
//! Listeners run synchronously on the emitting task and must not block;
//! a panicking listener is isolated and never propagates into the engine.

use serde::{Deserialize, Serialize};

use crate::subagent::SubagentStatus;

/// Why the engine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    AllComplete,
    MaxIterations,
    Cancelled,
    Aborted,
}

/// Events emitted over the engine's bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Started {
        session_id: String,
    },
    IterationStarted {
        iteration: u32,
        task_id: String,
    },
    IterationCompleted {
        iteration: u32,
        task_id: String,
        task_completed: bool,
    },
    IterationFailed {
        iteration: u32,
        task_id: String,
        error: String,
    },
    AllComplete,
    Stopped {
        reason: StopReason,
    },
    SubagentSpawned {
        node_id: String,
        agent_type: String,
        depth: u32,
    },
    SubagentFinished {
        node_id: String,
        status: SubagentStatus,
    },
}

type Listener = Box<dyn Fn(&EngineEvent) + Send + Sync>;

/// Callback-based event bus with panic isolation.
#[derive(Default)]
pub struct EventBus {
    listeners: Vec<Listener>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn emit(&self, event: &EngineEvent) {
        for listener in &self.listeners {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(event)))
                .is_err()
            {
                tracing::warn!(event = ?event, "engine event listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
