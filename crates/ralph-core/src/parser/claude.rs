//! Claude Code `stream-json` dialect.
//!
//! Top-level line types: `assistant` (content blocks + usage), `user`
//! (tool_result blocks), `result` (final text + totals), `error`, and
//! system noise which is surfaced as [`AgentEvent::Raw`].

use serde_json::Value;

use super::{
    AgentEvent, Dialect, LineBuffer, OutputParser, ParserState, cost_from_usage,
    process_json_line,
};

pub struct ClaudeJsonlParser {
    lines: LineBuffer,
    state: ParserState,
}

impl ClaudeJsonlParser {
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::default(),
            state: ParserState::default(),
        }
    }
}

impl Default for ClaudeJsonlParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputParser for ClaudeJsonlParser {
    fn dialect(&self) -> Dialect {
        Dialect::ClaudeJsonl
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
    let event_type = v.get("type").and_then(Value::as_str).unwrap_or("");

    match event_type {
        "assistant" => {
            if let Some(message) = v.get("message") {
                if let Some(blocks) = message.get("content").and_then(Value::as_array) {
                    for block in blocks {
                        parse_content_block(block, &mut events);
                    }
                }
                if let Some(cost) = cost_from_usage(message.get("usage"), None) {
                    events.push(cost);
                }
            }
        }

        // Tool results come back on `user` turns.
        "user" => {
            if let Some(blocks) = v
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_array)
            {
                for block in blocks {
                    if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                        events.push(AgentEvent::ToolResult {
                            tool_use_id: block
                                .get("tool_use_id")
                                .and_then(Value::as_str)
                                .map(String::from),
                            content: block.get("content").cloned().unwrap_or(Value::Null),
                            is_error: block
                                .get("is_error")
                                .and_then(Value::as_bool)
                                .unwrap_or(false),
                        });
                    }
                }
            }
        }

        "result" => {
            if let Some(text) = v.get("result").and_then(Value::as_str) {
                events.push(AgentEvent::Text {
                    content: text.to_string(),
                });
            }
            let total_usd = v.get("total_cost_usd").and_then(Value::as_f64);
            if let Some(cost) = cost_from_usage(v.get("usage"), total_usd) {
                events.push(cost);
            }
        }

        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .or_else(|| v.get("message").and_then(Value::as_str))
                .unwrap_or("unknown error")
                .to_string();
            events.push(AgentEvent::Error {
                message,
                code: v
                    .get("error")
                    .and_then(|e| e.get("type"))
                    .and_then(Value::as_str)
                    .map(String::from),
                status: v.get("status").and_then(Value::as_i64),
            });
        }

        _ => {
            events.push(AgentEvent::Raw { payload: v.clone() });
        }
    }

    events
}

fn parse_content_block(block: &Value, events: &mut Vec<AgentEvent>) {
    match block.get("type").and_then(Value::as_str).unwrap_or("") {
        "text" => {
            if let Some(text) = block.get("text").and_then(Value::as_str) {
                events.push(AgentEvent::Text {
                    content: text.to_string(),
                });
            }
        }
        "tool_use" => {
            events.push(AgentEvent::ToolCall {
                id: block.get("id").and_then(Value::as_str).map(String::from),
                name: block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                input: block.get("input").cloned().unwrap_or(Value::Null),
            });
        }
        _ => {}
    }
}
