//! Agent plugins: adapters around coding-agent CLIs.
//!
//! The [`AgentPlugin`] trait is the capability contract; concrete adapters
//! are registered in an [`AgentRegistry`] built at startup. Shipped
//! adapters: `claude`, `opencode`, `droid`, and `test` (a pass-through
//! driver for arbitrary executables, used by the test suites).
//!
//! Streaming is a channel of [`ExecutionEvent`]s plus a single completion
//! value on [`AgentHandle::wait`]; the terminal event is queued strictly
//! after the last output event.

pub mod claude;
pub mod droid;
pub mod opencode;
pub mod registry;
pub mod test_agent;
pub mod trait_def;
pub mod types;

pub use claude::ClaudeAgent;
pub use droid::DroidAgent;
pub use opencode::OpencodeAgent;
pub use registry::AgentRegistry;
pub use test_agent::TestAgent;
pub use trait_def::{AgentPlugin, PREFLIGHT_BUDGET};
pub use types::{
    AgentConfig, AgentExecutionResult, AgentHandle, AgentMeta, DetectResult, ExecuteOptions,
    ExecutionEvent, PreflightResult, SetupQuestion, StructuredFormat,
};

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::parser::{LineBuffer, extract_json, strip_ansi};
use crate::process::envfilter::EnvFilter;
use crate::process::{self, CommandSpec, OutputChunk, ProcessHandle, RunStatus};

/// Line-buffered JSONL splitter wrapping an adapter's stdout stream.
///
/// Streams parsed objects as they complete and flushes a partially buffered
/// final line when the stream ends. Malformed lines are dropped here; the
/// dialect parser keeps its own fallback record from the raw stdout.
#[derive(Debug, Default)]
pub struct JsonlBuffer {
    lines: LineBuffer,
}

impl JsonlBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Value> {
        self.lines
            .push(chunk)
            .iter()
            .filter_map(|line| parse_jsonl_line(line))
            .collect()
    }

    pub fn flush(&mut self) -> Vec<Value> {
        self.lines
            .flush()
            .and_then(|line| parse_jsonl_line(&line))
            .into_iter()
            .collect()
    }
}

fn parse_jsonl_line(line: &str) -> Option<Value> {
    let clean = strip_ansi(line);
    let json_part = extract_json(&clean)?;
    serde_json::from_str(json_part).ok()
}

/// Wrap a spawned process into an [`AgentHandle`], pumping output chunks
/// into [`ExecutionEvent`]s (and through a [`JsonlBuffer`] when the adapter
/// declares JSONL output).
pub(crate) fn stream_process(mut process: ProcessHandle, jsonl: bool) -> AgentHandle {
    let execution_id = process.execution_id;
    let cancel = process.cancel_token();
    let (tx, rx) = mpsc::channel(256);
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        // Event sends ignore errors: a consumer that stopped listening must
        // not prevent result resolution.
        let _ = tx.send(ExecutionEvent::Started { execution_id }).await;

        let mut buffer = if jsonl { Some(JsonlBuffer::new()) } else { None };

        if let Some(mut output) = process.take_output() {
            while let Some(chunk) = output.recv().await {
                match chunk {
                    OutputChunk::Stdout(text) => {
                        if let Some(buf) = buffer.as_mut() {
                            for value in buf.push(&text) {
                                let _ = tx.send(ExecutionEvent::Jsonl(value)).await;
                            }
                        }
                        let _ = tx.send(ExecutionEvent::Stdout(text)).await;
                    }
                    OutputChunk::Stderr(text) => {
                        let _ = tx.send(ExecutionEvent::Stderr(text)).await;
                    }
                }
            }
        }

        if let Some(buf) = buffer.as_mut() {
            for value in buf.flush() {
                let _ = tx.send(ExecutionEvent::Jsonl(value)).await;
            }
        }

        let result = process.wait().await;
        let _ = tx.send(ExecutionEvent::Ended(result.clone())).await;
        let _ = done_tx.send(result);
    });

    AgentHandle {
        execution_id,
        events: Some(rx),
        done: done_rx,
        cancel,
    }
}

/// Shared `detect` implementation: run `<command> --version` briefly.
pub(crate) async fn detect_command(command: &str) -> DetectResult {
    let spec = CommandSpec {
        program: command.to_string(),
        args: vec!["--version".to_string()],
        cwd: std::env::temp_dir(),
        env: std::env::vars().collect(),
        stdin: None,
        timeout: Some(Duration::from_secs(5)),
    };

    let result = process::run(spec).wait().await;
    match result.status {
        RunStatus::Completed if result.exit_code == Some(0) => DetectResult {
            available: true,
            version: result
                .stdout
                .lines()
                .next()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from),
            executable_path: Some(command.to_string()),
            error: None,
        },
        _ => DetectResult {
            available: false,
            version: None,
            executable_path: None,
            error: Some(if result.stderr.trim().is_empty() {
                format!("'{command} --version' did not succeed")
            } else {
                result.stderr.trim().to_string()
            }),
        },
    }
}

/// Apply the env filter (defaults ∪ user excludes, user passthrough) to the
/// parent environment, then add the deliberate extras.
pub(crate) fn filtered_env(
    options: &ExecuteOptions,
) -> anyhow::Result<HashMap<String, String>> {
    let filter = EnvFilter::with_defaults(&options.env_excludes, &options.env_passthrough)?;
    let mut env = filter.filter(&options.parent_env);
    env.extend(options.extra_env.clone());
    Ok(env)
}
