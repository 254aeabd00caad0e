//! OpenCode JSONL dialect.
//!
//! OpenCode reports a tool invocation as a single `tool_use` line that
//! already carries the output. Such a line is expanded into a ToolCall and
//! a ToolResult sharing a generated id, so downstream consumers (notably
//! the subagent trace parser) stay dialect-agnostic.

use serde_json::Value;
use uuid::Uuid;

use super::{
    AgentEvent, Dialect, LineBuffer, OutputParser, ParserState, cost_from_usage,
    process_json_line,
};

pub struct OpencodeJsonlParser {
    lines: LineBuffer,
    state: ParserState,
}

impl OpencodeJsonlParser {
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::default(),
            state: ParserState::default(),
        }
    }
}

impl Default for OpencodeJsonlParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputParser for OpencodeJsonlParser {
    fn dialect(&self) -> Dialect {
        Dialect::OpencodeJsonl
    }

    fn push(&mut self, chunk: &str) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        for line in self.lines.push(chunk) {
            events.extend(process_json_line(&mut self.state, &line, parse_line));
        }
        events
    }

    fn flush(&mut self) -> Vec<AgentEvent> {
        match self.lines.flush() {
            Some(line) => process_json_line(&mut self.state, &line, parse_line),
            None => Vec::new(),
        }
    }

    fn state(&self) -> &ParserState {
        &self.state
    }
}

fn parse_line(v: &Value) -> Vec<AgentEvent> {
    let mut events = Vec::new();

    match v.get("type").and_then(Value::as_str).unwrap_or("") {
        "message" => {
            if let Some(content) = v.get("content").and_then(Value::as_str) {
                events.push(AgentEvent::Text {
                    content: content.to_string(),
                });
            }
        }

        "tool_use" => {
            let name = v
                .get("name")
                .or_else(|| v.get("tool"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let input = v.get("input").cloned().unwrap_or(Value::Null);
            let id = v
                .get("id")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| format!("oc-{}", Uuid::new_v4()));

            events.push(AgentEvent::ToolCall {
                id: Some(id.clone()),
                name,
                input,
            });

            // Output already present: synthesize the matching result.
            if let Some(output) = v.get("output") {
                events.push(AgentEvent::ToolResult {
                    tool_use_id: Some(id),
                    content: output.clone(),
                    is_error: v.get("error").and_then(Value::as_bool).unwrap_or(false),
                });
            }
        }

        "step_finish" => {
            let total_usd = v.get("cost").and_then(Value::as_f64);
            if let Some(cost) = cost_from_usage(v.get("usage"), total_usd) {
                events.push(cost);
            }
        }

        "error" => {
            events.push(AgentEvent::Error {
                message: v
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
                code: v.get("code").and_then(Value::as_str).map(String::from),
                status: v.get("status").and_then(Value::as_i64),
            });
        }

        _ => {
            events.push(AgentEvent::Raw { payload: v.clone() });
        }
    }

    events
}
