//! Structured-output parsing for agent stdout streams.
//!
//! One parser per agent dialect, all normalizing to the common
//! [`AgentEvent`] model. Parsers are line-buffered and byte-split tolerant:
//! a JSONL object arrives exactly once no matter how the stream was chunked,
//! ANSI escapes are stripped, and TTY-wrapper prefixes before the first `{`
//! are ignored. Malformed lines are recorded, never fatal.

pub mod claude;
pub mod droid;
pub mod opencode;
pub mod text;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized event model shared by every dialect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Assistant-visible text.
    Text { content: String },
    /// The agent invoked a tool.
    ToolCall {
        id: Option<String>,
        name: String,
        input: Value,
    },
    /// A tool returned a value.
    ToolResult {
        tool_use_id: Option<String>,
        content: Value,
        is_error: bool,
    },
    /// The agent reported an error.
    Error {
        message: String,
        code: Option<String>,
        status: Option<i64>,
    },
    /// Token/cost accounting for one line of output.
    Cost {
        input_tokens: u64,
        output_tokens: u64,
        cache_read: u64,
        cache_write: u64,
        total_usd: f64,
    },
    /// A well-formed line the dialect does not model.
    Raw { payload: Value },
}

/// Monotone cost accumulator across a stream.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub total_usd: f64,
    /// Number of cost-bearing lines observed.
    pub events: u64,
}

/// Parser bookkeeping exposed to diagnostics.
#[derive(Debug, Clone, Default)]
pub struct ParserState {
    /// Text contents in arrival order.
    pub messages: Vec<String>,
    /// Lines that failed preprocessing or JSON parsing.
    pub fallback_lines: Vec<String>,
    pub cost: CostSummary,
}

impl ParserState {
    fn observe(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::Text { content } => self.messages.push(content.clone()),
            AgentEvent::Cost {
                input_tokens,
                output_tokens,
                cache_read,
                cache_write,
                total_usd,
            } => {
                self.cost.input_tokens += input_tokens;
                self.cost.output_tokens += output_tokens;
                self.cost.cache_read += cache_read;
                self.cost.cache_write += cache_write;
                self.cost.total_usd += total_usd;
                self.cost.events += 1;
            }
            _ => {}
        }
    }
}

/// Supported agent output dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    ClaudeJsonl,
    OpencodeJsonl,
    DroidJsonl,
    Text,
}

/// Streaming parser contract.
///
/// `push` accepts arbitrary byte-split chunks and returns the events for
/// every complete line consumed; `flush` processes a final unterminated
/// line when the stream ends.
pub trait OutputParser: Send {
    fn dialect(&self) -> Dialect;
    fn push(&mut self, chunk: &str) -> Vec<AgentEvent>;
    fn flush(&mut self) -> Vec<AgentEvent>;
    fn state(&self) -> &ParserState;
}

/// Construct the parser for a dialect.
pub fn parser_for(dialect: Dialect) -> Box<dyn OutputParser + Send> {
    match dialect {
        Dialect::ClaudeJsonl => Box::new(claude::ClaudeJsonlParser::new()),
        Dialect::OpencodeJsonl => Box::new(opencode::OpencodeJsonlParser::new()),
        Dialect::DroidJsonl => Box::new(droid::DroidJsonlParser::new()),
        Dialect::Text => Box::new(text::TextParser::new()),
    }
}

// ---------------------------------------------------------------------------
// Shared line machinery
// ---------------------------------------------------------------------------

/// Carries partial lines across `push` calls.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(idx) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=idx).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }
}

/// Remove ANSI escape sequences (CSI, OSC, and two-byte escapes).
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            // CSI: ESC [ params... final-byte (0x40..=0x7e)
            Some('[') => {
                chars.next();
                for n in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&n) {
                        break;
                    }
                }
            }
            // OSC: ESC ] ... terminated by BEL or ESC \
            Some(']') => {
                chars.next();
                while let Some(n) = chars.next() {
                    if n == '\u{7}' {
                        break;
                    }
                    if n == '\u{1b}' {
                        if chars.peek() == Some(&'\\') {
                            chars.next();
                        }
                        break;
                    }
                }
            }
            // Two-byte escape.
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

/// Slice a line from its first `{`, tolerating TTY-wrapper prefixes.
pub(crate) fn extract_json(line: &str) -> Option<&str> {
    line.find('{').map(|idx| &line[idx..])
}

/// Preprocess one line, parse it as JSON, and map it through `parse`.
///
/// Malformed lines land in `state.fallback_lines` and yield no events.
pub(crate) fn process_json_line(
    state: &mut ParserState,
    line: &str,
    parse: impl FnOnce(&Value) -> Vec<AgentEvent>,
) -> Vec<AgentEvent> {
    let clean = strip_ansi(line);
    if clean.trim().is_empty() {
        return Vec::new();
    }

    let Some(json_part) = extract_json(&clean) else {
        state.fallback_lines.push(clean);
        return Vec::new();
    };

    match serde_json::from_str::<Value>(json_part) {
        Ok(value) => {
            let events = parse(&value);
            for event in &events {
                state.observe(event);
            }
            events
        }
        Err(_) => {
            state.fallback_lines.push(clean);
            Vec::new()
        }
    }
}

/// Read a cost event out of a `usage` object plus optional dollar total.
///
/// Returns `None` when every field is zero or absent.
pub(crate) fn cost_from_usage(usage: Option<&Value>, total_usd: Option<f64>) -> Option<AgentEvent> {
    let get = |key: &str| {
        usage
            .and_then(|u| u.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    let input_tokens = get("input_tokens");
    let output_tokens = get("output_tokens");
    let cache_read = get("cache_read_input_tokens");
    let cache_write = get("cache_creation_input_tokens");
    let total_usd = total_usd.unwrap_or(0.0);

    if input_tokens == 0
        && output_tokens == 0
        && cache_read == 0
        && cache_write == 0
        && total_usd == 0.0
    {
        return None;
    }

    Some(AgentEvent::Cost {
        input_tokens,
        output_tokens,
        cache_read,
        cache_write,
        total_usd,
    })
}
