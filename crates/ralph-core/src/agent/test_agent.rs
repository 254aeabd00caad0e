//! Test agent: a pass-through driver for arbitrary executables.
//!
//! Runs whatever command the configuration names, feeds it the prompt on
//! stdin, and treats its stdout as the plain-text dialect. The engine's
//! integration suites point this at scripted fakes; operators can point it
//! at anything that reads a prompt and prints output.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use super::trait_def::AgentPlugin;
use super::types::{AgentConfig, AgentHandle, AgentMeta, DetectResult, ExecuteOptions};
use super::{filtered_env, stream_process};
use crate::parser::Dialect;
use crate::process::{self, CommandSpec};

pub struct TestAgent {
    meta: AgentMeta,
    command: String,
    extra_args: Vec<String>,
}

impl TestAgent {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            meta: AgentMeta {
                id: "test".to_string(),
                name: "Test command".to_string(),
                default_command: "cat".to_string(),
                supports_streaming: true,
                supports_interrupt: true,
                supports_file_context: false,
                supports_subagent_tracing: false,
                structured_output_format: None,
            },
            command: config.command.clone().unwrap_or_else(|| "cat".to_string()),
            extra_args: config.extra_args.clone(),
        }
    }
}

#[async_trait]
impl AgentPlugin for TestAgent {
    fn meta(&self) -> &AgentMeta {
        &self.meta
    }

    fn dialect(&self) -> Dialect {
        Dialect::Text
    }

    async fn detect(&self) -> DetectResult {
        // An explicit path must exist; a bare name is resolved by the OS at
        // spawn time.
        let is_path = self.command.contains(std::path::MAIN_SEPARATOR);
        if is_path && !PathBuf::from(&self.command).exists() {
            return DetectResult {
                available: false,
                version: None,
                executable_path: None,
                error: Some(format!("{} does not exist", self.command)),
            };
        }
        DetectResult {
            available: true,
            version: None,
            executable_path: Some(self.command.clone()),
            error: None,
        }
    }

    async fn execute(
        &self,
        prompt: &str,
        _files: &[PathBuf],
        options: &ExecuteOptions,
    ) -> Result<AgentHandle> {
        let spec = CommandSpec {
            program: self.command.clone(),
            args: self.extra_args.clone(),
            cwd: options.cwd.clone(),
            env: filtered_env(options)?,
            stdin: Some(prompt.to_string()),
            timeout: options.timeout,
        };
        Ok(stream_process(process::run(spec), false))
    }
}
