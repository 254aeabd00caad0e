//! Tracker plugins: task sources the engine iterates over.
//!
//! The [`TrackerPlugin`] trait is the capability contract; concrete
//! backends are registered in a [`TrackerRegistry`] built at startup.
//! Shipped trackers: `json-prd` (a JSON PRD document, bidirectional) and
//! `markdown` (a read-only checklist).

pub mod json_prd;
pub mod markdown;
pub mod registry;
pub mod trait_def;
pub mod types;

pub use json_prd::JsonPrdTracker;
pub use markdown::MarkdownTracker;
pub use registry::{TrackerConfig, TrackerRegistry};
pub use trait_def::TrackerPlugin;
pub use types::{CompleteResult, PrdContext, Task, TaskFilter, TaskStatus, TrackerMeta};

/// Prompt template used when a tracker has no bespoke one.
///
/// Variables are rendered by the template engine; missing values render
/// empty rather than as literal placeholders.
pub const DEFAULT_TEMPLATE: &str = "\
# Task {{taskId}}: {{taskTitle}}

{{taskDescription}}

## Acceptance criteria

{{taskAcceptance}}

Status: {{taskStatus}} · Priority: {{taskPriority}} · Labels: {{taskLabels}}
Iteration {{iteration}} of {{totalIterations}}.

## Recent progress

{{progressSummary}}

## Codebase patterns

{{#each codebasePatterns}}- {{this}}
{{/each}}

{{prdContext}}

Work on this task only. When it is fully done, print
<promise>COMPLETE</promise> on its own line. If more work remains, stop
without the marker and it will continue next iteration.
";
