//! Droid JSONL dialect.
//!
//! Flat line shapes: `message`, `tool_call`, `tool_result`, `usage`,
//! `error`.

use serde_json::Value;

use super::{
    AgentEvent, Dialect, LineBuffer, OutputParser, ParserState, cost_from_usage,
    process_json_line,
};

pub struct DroidJsonlParser {
    lines: LineBuffer,
    state: ParserState,
}

impl DroidJsonlParser {
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::default(),
            state: ParserState::default(),
        }
    }
}

impl Default for DroidJsonlParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputParser for DroidJsonlParser {
    fn dialect(&self) -> Dialect {
        Dialect::DroidJsonl
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
            if let Some(text) = v.get("text").and_then(Value::as_str) {
                events.push(AgentEvent::Text {
                    content: text.to_string(),
                });
            }
        }

        "tool_call" => {
            events.push(AgentEvent::ToolCall {
                id: v.get("id").and_then(Value::as_str).map(String::from),
                name: v
                    .get("tool")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                input: v.get("arguments").cloned().unwrap_or(Value::Null),
            });
        }

        "tool_result" => {
            events.push(AgentEvent::ToolResult {
                tool_use_id: v.get("call_id").and_then(Value::as_str).map(String::from),
                content: v.get("output").cloned().unwrap_or(Value::Null),
                is_error: v
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            });
        }

        "usage" => {
            let total_usd = v.get("total_usd").and_then(Value::as_f64);
            if let Some(cost) = cost_from_usage(Some(v), total_usd) {
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
