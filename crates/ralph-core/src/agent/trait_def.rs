//! The `AgentPlugin` trait -- the adapter interface for agent CLIs.
//!
//! Object-safe so adapters can be stored as `Box<dyn AgentPlugin>` in the
//! [`super::AgentRegistry`].

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use super::types::{
    AgentHandle, AgentMeta, DetectResult, ExecuteOptions, PreflightResult, SetupQuestion,
};
use crate::parser::{Dialect, OutputParser, parser_for};
use crate::process::RunStatus;

/// Wall-clock budget for the preflight check.
pub const PREFLIGHT_BUDGET: Duration = Duration::from_secs(15);

/// Adapter interface for spawning and observing coding agents.
///
/// Adapters deliver the prompt via stdin (never argv interpolation) and
/// filter the environment before every spawn.
#[async_trait]
pub trait AgentPlugin: Send + Sync {
    /// Static capabilities of this adapter.
    fn meta(&self) -> &AgentMeta;

    /// The stdout dialect this adapter's output parser understands.
    fn dialect(&self) -> Dialect;

    /// A fresh output parser for one execution.
    fn make_parser(&self) -> Box<dyn OutputParser + Send> {
        parser_for(self.dialect())
    }

    /// Probe whether the agent CLI is installed and report its version.
    /// Never runs a real task.
    async fn detect(&self) -> DetectResult;

    /// Cheap end-to-end check: detect, then a trivial execute that must
    /// produce output within [`PREFLIGHT_BUDGET`].
    async fn preflight(&self) -> PreflightResult {
        let started = Instant::now();

        let detect = self.detect().await;
        if !detect.available {
            return PreflightResult {
                success: false,
                duration_ms: started.elapsed().as_millis() as u64,
                error: detect
                    .error
                    .or_else(|| Some(format!("{} is not installed", self.meta().name))),
                suggestion: Some(format!(
                    "install the '{}' CLI and make sure it is on PATH",
                    self.meta().default_command
                )),
            };
        }

        let mut options = ExecuteOptions::for_workspace(std::env::temp_dir());
        options.timeout = Some(PREFLIGHT_BUDGET);

        let handle = match self
            .execute("Reply with the single word: ready", &[], &options)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                return PreflightResult {
                    success: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(format!("{e:#}")),
                    suggestion: None,
                };
            }
        };

        let result = handle.wait().await;
        let produced_output = !result.stdout.trim().is_empty();
        let success = result.status == RunStatus::Completed
            && result.exit_code == Some(0)
            && produced_output;

        PreflightResult {
            success,
            duration_ms: started.elapsed().as_millis() as u64,
            error: if success {
                None
            } else if !produced_output {
                Some("agent produced no output".to_string())
            } else {
                Some(format!(
                    "agent exited with status {:?} (code {:?}): {}",
                    result.status,
                    result.exit_code,
                    result.stderr.trim()
                ))
            },
            suggestion: if success {
                None
            } else {
                Some(format!(
                    "run '{} --version' manually to check authorization",
                    self.meta().default_command
                ))
            },
        }
    }

    /// Spawn the agent for one prompt.
    ///
    /// `files` is advisory context; adapters with
    /// `supports_file_context: false` ignore it.
    async fn execute(
        &self,
        prompt: &str,
        files: &[PathBuf],
        options: &ExecuteOptions,
    ) -> Result<AgentHandle>;

    /// Questions the setup wizard would ask. Contract shape only.
    fn setup_questions(&self) -> Vec<SetupQuestion> {
        Vec::new()
    }

    /// Whether a model name is valid for this adapter.
    fn validate_model(&self, _model: &str) -> bool {
        true
    }

    /// Whether the adapter's configuration is usable. Contract shape for
    /// the setup wizard; the default defers to `detect`.
    async fn validate_setup(&self) -> DetectResult {
        self.detect().await
    }
}

impl std::fmt::Debug for dyn AgentPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPlugin")
            .field("id", &self.meta().id)
            .finish()
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn AgentPlugin) {}
};
