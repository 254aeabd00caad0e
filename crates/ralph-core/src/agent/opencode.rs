//! OpenCode adapter.
//!
//! Spawns `opencode run --format jsonl` with the prompt on stdin. OpenCode
//! emits combined tool events (call + output on one line); the dialect
//! parser expands those before anything downstream sees them.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use super::trait_def::AgentPlugin;
use super::types::{
    AgentConfig, AgentHandle, AgentMeta, DetectResult, ExecuteOptions, StructuredFormat,
};
use super::{detect_command, filtered_env, stream_process};
use crate::parser::Dialect;
use crate::process::{self, CommandSpec};

pub struct OpencodeAgent {
    meta: AgentMeta,
    command: String,
    model: Option<String>,
    extra_args: Vec<String>,
}

impl OpencodeAgent {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            meta: AgentMeta {
                id: "opencode".to_string(),
                name: "OpenCode".to_string(),
                default_command: "opencode".to_string(),
                supports_streaming: true,
                supports_interrupt: true,
                supports_file_context: false,
                supports_subagent_tracing: true,
                structured_output_format: Some(StructuredFormat::Jsonl),
            },
            command: config
                .command
                .clone()
                .unwrap_or_else(|| "opencode".to_string()),
            model: config.model.clone(),
            extra_args: config.extra_args.clone(),
        }
    }
}

#[async_trait]
impl AgentPlugin for OpencodeAgent {
    fn meta(&self) -> &AgentMeta {
        &self.meta
    }

    fn dialect(&self) -> Dialect {
        Dialect::OpencodeJsonl
    }

    async fn detect(&self) -> DetectResult {
        detect_command(&self.command).await
    }

    async fn execute(
        &self,
        prompt: &str,
        _files: &[PathBuf],
        options: &ExecuteOptions,
    ) -> Result<AgentHandle> {
        let mut args: Vec<String> = ["run", "--format", "jsonl"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.extend(self.extra_args.iter().cloned());

        let spec = CommandSpec {
            program: self.command.clone(),
            args,
            cwd: options.cwd.clone(),
            env: filtered_env(options)?,
            stdin: Some(prompt.to_string()),
            timeout: options.timeout,
        };

        Ok(stream_process(process::run(spec), true))
    }
}
