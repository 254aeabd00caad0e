//! Claude Code adapter.
//!
//! Spawns `claude -p --output-format stream-json` with the prompt on stdin
//! and parses the JSONL stream via the Claude dialect parser.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use super::trait_def::AgentPlugin;
use super::types::{
    AgentConfig, AgentHandle, AgentMeta, DetectResult, ExecuteOptions, SetupQuestion,
    StructuredFormat,
};
use super::{detect_command, filtered_env, stream_process};
use crate::parser::Dialect;
use crate::process::{self, CommandSpec};

pub struct ClaudeAgent {
    meta: AgentMeta,
    command: String,
    model: Option<String>,
    extra_args: Vec<String>,
}

impl ClaudeAgent {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            meta: AgentMeta {
                id: "claude".to_string(),
                name: "Claude Code".to_string(),
                default_command: "claude".to_string(),
                supports_streaming: true,
                supports_interrupt: true,
                supports_file_context: false,
                supports_subagent_tracing: true,
                structured_output_format: Some(StructuredFormat::Jsonl),
            },
            command: config.command.clone().unwrap_or_else(|| "claude".to_string()),
            model: config.model.clone(),
            extra_args: config.extra_args.clone(),
        }
    }
}

#[async_trait]
impl AgentPlugin for ClaudeAgent {
    fn meta(&self) -> &AgentMeta {
        &self.meta
    }

    fn dialect(&self) -> Dialect {
        Dialect::ClaudeJsonl
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
        let mut args: Vec<String> = ["-p", "--output-format", "stream-json", "--verbose"]
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
            // The prompt goes through stdin so shell metacharacters
            // round-trip unchanged.
            stdin: Some(prompt.to_string()),
            timeout: options.timeout,
        };

        Ok(stream_process(process::run(spec), true))
    }

    fn setup_questions(&self) -> Vec<SetupQuestion> {
        vec![SetupQuestion {
            key: "ANTHROPIC_API_KEY".to_string(),
            prompt: "Anthropic API key (leave empty to use claude login)".to_string(),
            default: None,
            secret: true,
        }]
    }

    fn validate_model(&self, model: &str) -> bool {
        model.starts_with("claude-") || matches!(model, "sonnet" | "opus" | "haiku")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ExecutionEvent;
    use crate::process::RunStatus;
    use ralph_test_utils::write_script;
    use std::collections::HashMap;

    fn agent_for(script: &std::path::Path) -> ClaudeAgent {
        ClaudeAgent::new(&AgentConfig {
            command: Some(script.to_str().unwrap().to_string()),
            model: None,
            extra_args: Vec::new(),
        })
    }

    fn options(dir: &std::path::Path) -> ExecuteOptions {
        let mut options = ExecuteOptions::for_workspace(dir);
        options.parent_env = HashMap::from([(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_default(),
        )]);
        options
    }

    #[tokio::test]
    async fn streams_jsonl_events_and_resolves_after_them() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = write_script(
            tmp.path(),
            "fake_claude.sh",
            "cat > /dev/null\n\
             echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hi\"}]}}'\n\
             echo '{\"type\":\"result\",\"result\":\"done\"}'\n",
        );

        let agent = agent_for(&script);
        let mut handle = agent
            .execute("do the task", &[], &options(tmp.path()))
            .await
            .unwrap();

        let mut rx = handle.take_events().unwrap();
        let mut jsonl = 0;
        let mut saw_ended = false;
        while let Some(event) = rx.recv().await {
            match event {
                ExecutionEvent::Jsonl(_) => {
                    assert!(!saw_ended, "jsonl after Ended");
                    jsonl += 1;
                }
                ExecutionEvent::Ended(_) => saw_ended = true,
                _ => {}
            }
        }
        assert_eq!(jsonl, 2);
        assert!(saw_ended);

        let result = handle.wait().await;
        assert_eq!(result.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn prompt_reaches_the_agent_verbatim_via_stdin() {
        let tmp = tempfile::TempDir::new().unwrap();
        // Echo stdin back as the result payload.
        let script = write_script(tmp.path(), "echoer.sh", "PROMPT=$(cat)\nprintf '%s' \"$PROMPT\"\n");

        let agent = agent_for(&script);
        let prompt = "tricky & | < > \"quoted\" $(sub)";
        let handle = agent
            .execute(prompt, &[], &options(tmp.path()))
            .await
            .unwrap();
        let result = handle.wait().await;
        assert_eq!(result.stdout, prompt);
    }

    #[tokio::test]
    async fn secrets_are_filtered_from_the_child_env() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = write_script(
            tmp.path(),
            "env_probe.sh",
            "cat > /dev/null\nprintf 'key=[%s] ok=[%s]' \"$ANTHROPIC_API_KEY\" \"$FOO\"\n",
        );

        let agent = agent_for(&script);
        let mut opts = options(tmp.path());
        opts.parent_env
            .insert("ANTHROPIC_API_KEY".to_string(), "sk-secret".to_string());
        opts.parent_env.insert("FOO".to_string(), "ok".to_string());

        let result = agent.execute("p", &[], &opts).await.unwrap().wait().await;
        assert_eq!(result.stdout, "key=[] ok=[ok]");
    }

    #[tokio::test]
    async fn passthrough_readmits_an_excluded_key() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = write_script(
            tmp.path(),
            "env_probe.sh",
            "cat > /dev/null\nprintf '%s' \"$ANTHROPIC_API_KEY\"\n",
        );

        let agent = agent_for(&script);
        let mut opts = options(tmp.path());
        opts.parent_env
            .insert("ANTHROPIC_API_KEY".to_string(), "sk-secret".to_string());
        opts.env_passthrough.push("ANTHROPIC_API_KEY".to_string());

        let result = agent.execute("p", &[], &opts).await.unwrap().wait().await;
        assert_eq!(result.stdout, "sk-secret");
    }

    #[tokio::test]
    async fn preflight_succeeds_against_a_talking_fake() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = write_script(
            tmp.path(),
            "ready.sh",
            "if [ \"$1\" = \"--version\" ]; then echo 'claude 1.0.0'; exit 0; fi\n\
             cat > /dev/null\necho '{\"type\":\"result\",\"result\":\"ready\"}'\n",
        );

        let agent = agent_for(&script);
        let preflight = agent.preflight().await;
        assert!(preflight.success, "error: {:?}", preflight.error);
    }

    #[tokio::test]
    async fn preflight_fails_for_missing_binary_with_suggestion() {
        let agent = ClaudeAgent::new(&AgentConfig {
            command: Some("/nonexistent/claude".to_string()),
            ..Default::default()
        });
        let preflight = agent.preflight().await;
        assert!(!preflight.success);
        assert!(preflight.suggestion.is_some());
    }

    #[test]
    fn model_validation() {
        let agent = ClaudeAgent::new(&AgentConfig::default());
        assert!(agent.validate_model("claude-sonnet-4-5"));
        assert!(agent.validate_model("opus"));
        assert!(!agent.validate_model("gpt-4o"));
    }
}
