//! Subagent trace parsing.
//!
//! Consumes the normalized [`AgentEvent`] stream and reconstructs the tree
//! of Task-tool invocations: a `ToolCall` named `task` (case-insensitive)
//! spawns a node, the `ToolResult` carrying the same tool-use id completes
//! it. When a spawn happens while another node is still running, the most
//! recently spawned running node is treated as the parent.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::parser::AgentEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Running,
    Completed,
    Error,
}

/// One node in the subagent tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentNode {
    pub id: String,
    pub tool_call_id: String,
    pub parent_id: Option<String>,
    pub children_ids: Vec<String>,
    pub agent_type: String,
    pub description: String,
    pub prompt: String,
    pub status: SubagentStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub depth: u32,
}

/// Change reported back to the caller after feeding one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubagentUpdate {
    Spawned { id: String },
    Finished { id: String },
}

/// Aggregate view over the whole trace.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub total_spawned: usize,
    pub completed: usize,
    pub running: usize,
    pub errored: usize,
    pub max_depth: u32,
    pub total_duration_ms: u64,
    pub by_agent_type: BTreeMap<String, usize>,
}

/// Stateful consumer of [`AgentEvent`]s maintaining the subagent tree.
#[derive(Debug, Default)]
pub struct SubagentTracker {
    nodes: HashMap<String, SubagentNode>,
    spawn_order: Vec<String>,
    seq: u64,
}

impl SubagentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event. Returns the resulting tree change, if any.
    pub fn observe(&mut self, event: &AgentEvent) -> Option<SubagentUpdate> {
        match event {
            AgentEvent::ToolCall { id, name, input } if name.eq_ignore_ascii_case("task") => {
                Some(self.spawn(id.clone(), input))
            }
            AgentEvent::ToolResult {
                tool_use_id: Some(tool_use_id),
                content,
                is_error,
            } => self.finish(tool_use_id, content, *is_error),
            _ => None,
        }
    }

    fn spawn(&mut self, tool_call_id: Option<String>, input: &Value) -> SubagentUpdate {
        self.seq += 1;
        let id = format!("sub-{}", self.seq);
        let tool_call_id = tool_call_id.unwrap_or_else(|| id.clone());

        // Parent: the most recently spawned node that is still running.
        let parent_id = self
            .spawn_order
            .iter()
            .rev()
            .find(|pid| {
                self.nodes
                    .get(*pid)
                    .is_some_and(|n| n.status == SubagentStatus::Running)
            })
            .cloned();

        let depth = parent_id
            .as_deref()
            .and_then(|pid| self.nodes.get(pid))
            .map(|p| p.depth + 1)
            .unwrap_or(0);

        let text_field = |key: &str| {
            input
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let node = SubagentNode {
            id: id.clone(),
            tool_call_id,
            parent_id: parent_id.clone(),
            children_ids: Vec::new(),
            agent_type: text_field("subagent_type"),
            description: text_field("description"),
            prompt: text_field("prompt"),
            status: SubagentStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            output: None,
            depth,
        };

        if let Some(parent_id) = &parent_id {
            if let Some(parent) = self.nodes.get_mut(parent_id) {
                parent.children_ids.push(id.clone());
            }
        }

        self.nodes.insert(id.clone(), node);
        self.spawn_order.push(id.clone());
        SubagentUpdate::Spawned { id }
    }

    fn finish(
        &mut self,
        tool_use_id: &str,
        content: &Value,
        is_error: bool,
    ) -> Option<SubagentUpdate> {
        let id = self
            .spawn_order
            .iter()
            .find(|id| {
                self.nodes.get(*id).is_some_and(|n| {
                    n.status == SubagentStatus::Running && n.tool_call_id == tool_use_id
                })
            })
            .cloned()?;

        let node = self.nodes.get_mut(&id)?;
        node.status = if is_error {
            SubagentStatus::Error
        } else {
            SubagentStatus::Completed
        };
        node.ended_at = Some(Utc::now());
        node.output = Some(match content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });

        Some(SubagentUpdate::Finished { id })
    }

    /// Look up a node by its tracker-assigned id.
    pub fn get(&self, id: &str) -> Option<&SubagentNode> {
        self.nodes.get(id)
    }

    /// All nodes in spawn order.
    pub fn nodes(&self) -> Vec<&SubagentNode> {
        self.spawn_order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .collect()
    }

    /// Root nodes (depth 0) in spawn order.
    pub fn roots(&self) -> Vec<&SubagentNode> {
        self.nodes()
            .into_iter()
            .filter(|n| n.parent_id.is_none())
            .collect()
    }

    pub fn summary(&self) -> TraceSummary {
        let mut summary = TraceSummary::default();
        for node in self.nodes.values() {
            summary.total_spawned += 1;
            match node.status {
                SubagentStatus::Running => summary.running += 1,
                SubagentStatus::Completed => summary.completed += 1,
                SubagentStatus::Error => summary.errored += 1,
            }
            summary.max_depth = summary.max_depth.max(node.depth);
            if let Some(ended_at) = node.ended_at {
                let ms = (ended_at - node.started_at).num_milliseconds().max(0) as u64;
                summary.total_duration_ms += ms;
            }
            let agent_type = if node.agent_type.is_empty() {
                "unknown".to_string()
            } else {
                node.agent_type.clone()
            };
            *summary.by_agent_type.entry(agent_type).or_insert(0) += 1;
        }
        summary
    }
}
