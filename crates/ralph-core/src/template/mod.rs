//! Prompt rendering.
//!
//! Tracker plugins supply a Mustache-compatible template string; the engine
//! renders it with a fixed variable set. Missing variables render empty,
//! never as literal placeholders.

use anyhow::{Context, Result};
use handlebars::Handlebars;
use serde_json::json;

use crate::tracker::{PrdContext, Task};

/// The fixed variable set available to prompt templates.
#[derive(Debug, Clone)]
pub struct PromptVars<'a> {
    pub task: &'a Task,
    pub iteration: u32,
    /// 0 means unlimited.
    pub total_iterations: u32,
    pub progress_summary: String,
    pub codebase_patterns: Vec<String>,
    pub prd_context: Option<&'a PrdContext>,
}

/// Render `template` with the given variables.
pub fn render_prompt(template: &str, vars: &PromptVars<'_>) -> Result<String> {
    let mut registry = Handlebars::new();
    // Prompts go to an agent over stdin, not to HTML.
    registry.register_escape_fn(handlebars::no_escape);

    let total_iterations = if vars.total_iterations == 0 {
        "unlimited".to_string()
    } else {
        vars.total_iterations.to_string()
    };

    let data = json!({
        "taskId": vars.task.id,
        "taskTitle": vars.task.title,
        "taskDescription": vars.task.description.clone().unwrap_or_default(),
        "taskStatus": vars.task.status.to_string(),
        "taskPriority": vars.task.priority,
        "taskLabels": vars.task.labels.join(", "),
        "taskAcceptance": vars.task.acceptance_criteria.clone().unwrap_or_default(),
        "iteration": vars.iteration,
        "totalIterations": total_iterations,
        "progressSummary": vars.progress_summary,
        "codebasePatterns": vars.codebase_patterns,
        "prdContext": vars.prd_context.map(|p| p.content.clone()).unwrap_or_default(),
    });

    registry
        .render_template(template, &data)
        .context("failed to render prompt template")
}
