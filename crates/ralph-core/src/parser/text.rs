//! Pass-through dialect for agents with no structured output.
//!
//! Every complete line becomes a [`AgentEvent::Text`]; ANSI escapes are
//! still stripped so TTY-decorated CLIs stay readable.

use super::{AgentEvent, Dialect, LineBuffer, OutputParser, ParserState, strip_ansi};

pub struct TextParser {
    lines: LineBuffer,
    state: ParserState,
}

impl TextParser {
    pub fn new() -> Self {
        Self {
            lines: LineBuffer::default(),
            state: ParserState::default(),
        }
    }

    fn emit(&mut self, line: &str) -> Option<AgentEvent> {
        let clean = strip_ansi(line);
        if clean.trim().is_empty() {
            return None;
        }
        self.state.messages.push(clean.clone());
        Some(AgentEvent::Text { content: clean })
    }
}

impl Default for TextParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputParser for TextParser {
    fn dialect(&self) -> Dialect {
        Dialect::Text
    }

    fn push(&mut self, chunk: &str) -> Vec<AgentEvent> {
        let lines = self.lines.push(chunk);
        lines.iter().filter_map(|line| self.emit(line)).collect()
    }

    fn flush(&mut self) -> Vec<AgentEvent> {
        match self.lines.flush() {
            Some(line) => self.emit(&line).into_iter().collect(),
            None => Vec::new(),
        }
    }

    fn state(&self) -> &ParserState {
        &self.state
    }
}
