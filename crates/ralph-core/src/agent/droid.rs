//! Droid adapter.
//!
//! Spawns `droid exec --output-format jsonl` with the prompt on stdin.

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

pub struct DroidAgent {
    meta: AgentMeta,
    command: String,
    model: Option<String>,
    extra_args: Vec<String>,
}

impl DroidAgent {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            meta: AgentMeta {
                id: "droid".to_string(),
                name: "Droid".to_string(),
                default_command: "droid".to_string(),
                supports_streaming: true,
                supports_interrupt: true,
                supports_file_context: false,
                supports_subagent_tracing: false,
                structured_output_format: Some(StructuredFormat::Jsonl),
            },
            command: config.command.clone().unwrap_or_else(|| "droid".to_string()),
            model: config.model.clone(),
            extra_args: config.extra_args.clone(),
        }
    }
}

#[async_trait]
impl AgentPlugin for DroidAgent {
    fn meta(&self) -> &AgentMeta {
        &self.meta
    }

    fn dialect(&self) -> Dialect {
        Dialect::DroidJsonl
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
        let mut args: Vec<String> = ["exec", "--output-format", "jsonl"]
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::RunStatus;
    use ralph_test_utils::write_script;
    use std::collections::HashMap;

    #[tokio::test]
    async fn executes_a_fake_droid_script() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = write_script(
            tmp.path(),
            "fake_droid.sh",
            "cat > /dev/null\necho '{\"type\":\"message\",\"text\":\"done\"}'\n",
        );

        let agent = DroidAgent::new(&AgentConfig {
            command: Some(script.to_str().unwrap().to_string()),
            ..Default::default()
        });

        let mut options = ExecuteOptions::for_workspace(tmp.path());
        options.parent_env = HashMap::from([(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_default(),
        )]);

        let result = agent.execute("p", &[], &options).await.unwrap().wait().await;
        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.stdout.contains("done"));
    }
}
