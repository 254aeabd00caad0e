//! Append-only markdown progress log.
//!
//! Lives at `<workspace>/.ralph-tui/progress.md`. The first write creates a
//! header and a reserved "Codebase Patterns" section whose bullets are fed
//! back into every prompt. Per iteration, the log records a heading, the
//! task, the duration, the last few human-readable lines the agent printed
//! before the completion marker, and any `★ Insight` blocks verbatim.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::session::session_dir;

/// Sentinel substring an agent prints to signal the task is done.
pub const COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";

/// Marker opening an insight block.
pub const INSIGHT_MARKER: &str = "★ Insight";

/// Case-insensitive check for the completion marker.
pub fn contains_completion_marker(text: &str) -> bool {
    find_marker(text).is_some()
}

fn find_marker(text: &str) -> Option<usize> {
    let needle = COMPLETION_MARKER.as_bytes();
    text.as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

/// Notes-worthy data for one finished iteration.
#[derive(Debug, Clone)]
pub struct IterationRecord<'a> {
    pub iteration: u32,
    pub success: bool,
    pub task_id: &'a str,
    pub task_title: &'a str,
    pub duration_ms: u64,
    /// Raw agent stdout; filtered by [`extract_notes`] before writing.
    pub output: &'a str,
}

const HEADER: &str = "# Progress Log\n\n\
## Codebase Patterns\n\n\
<!-- ralph:patterns - bullets below are injected into every prompt -->\n\n\
---\n";

/// Handle on a workspace progress log.
#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn for_workspace(workspace: &Path) -> Self {
        Self {
            path: session_dir(workspace).join("progress.md"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_header(&self) -> std::io::Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
            let ignore = parent.join(".gitignore");
            if !ignore.exists() {
                std::fs::write(&ignore, "*\n")?;
            }
        }
        std::fs::write(&self.path, HEADER)
    }

    /// Append one iteration entry.
    pub fn append_iteration(&self, record: &IterationRecord<'_>) -> std::io::Result<()> {
        self.ensure_header()?;

        let mark = if record.success { "✓" } else { "✗" };
        let mut entry = format!(
            "\n## {mark} Iteration {n} — {id}: {title}\n_{ts} · {secs:.1}s_\n",
            n = record.iteration,
            id = record.task_id,
            title = record.task_title,
            ts = Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            secs = record.duration_ms as f64 / 1000.0,
        );

        let notes = extract_notes(record.output);
        let tail_start = notes.len().saturating_sub(5);
        for line in &notes[tail_start..] {
            entry.push_str(line);
            entry.push('\n');
        }

        for block in extract_insights(record.output) {
            entry.push('\n');
            entry.push_str(&block);
            entry.push('\n');
        }

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)?;
        file.write_all(entry.as_bytes())
    }

    /// The last `n` iteration entries, most recent last, for the prompt's
    /// progress summary.
    pub fn recent_entries(&self, n: usize) -> Vec<String> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };

        let mut entries = Vec::new();
        for section in contents.split("\n## ") {
            if section.starts_with('✓') || section.starts_with('✗') {
                entries.push(format!("## {}", section.trim_end()));
            }
        }
        let start = entries.len().saturating_sub(n);
        entries.split_off(start)
    }

    /// Bullets of the "Codebase Patterns" section.
    pub fn codebase_patterns(&self) -> Vec<String> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };

        let mut in_section = false;
        let mut patterns = Vec::new();
        for line in contents.lines() {
            if line.starts_with("## ") {
                in_section = line == "## Codebase Patterns";
                continue;
            }
            if !in_section || line.starts_with("---") {
                if line.starts_with("---") {
                    in_section = false;
                }
                continue;
            }
            if let Some(bullet) = line.trim_start().strip_prefix("- ") {
                patterns.push(bullet.trim().to_string());
            }
        }
        patterns
    }

    /// Add a bullet to the "Codebase Patterns" section.
    pub fn add_pattern(&self, pattern: &str) -> std::io::Result<()> {
        self.ensure_header()?;
        let contents = std::fs::read_to_string(&self.path)?;

        let anchor = "<!-- ralph:patterns - bullets below are injected into every prompt -->";
        let updated = match contents.find(anchor) {
            Some(idx) => {
                let insert_at = idx + anchor.len();
                let mut updated = String::with_capacity(contents.len() + pattern.len() + 4);
                updated.push_str(&contents[..insert_at]);
                updated.push_str(&format!("\n- {pattern}"));
                updated.push_str(&contents[insert_at..]);
                updated
            }
            None => format!("{contents}\n- {pattern}\n"),
        };

        let tmp = self.path.with_extension("md.tmp");
        std::fs::write(&tmp, updated)?;
        std::fs::rename(&tmp, &self.path)
    }
}

/// Filter raw agent stdout down to human-readable notes.
///
/// Drops line-number artifacts (`NNN|` prefixes), bare XML-like markers,
/// bracket/punctuation-only lines, and everything at or after the
/// completion marker.
pub fn extract_notes(output: &str) -> Vec<String> {
    let cut = find_marker(output).unwrap_or(output.len());
    output[..cut]
        .lines()
        .filter(|line| !line.trim().is_empty() && !is_artifact_line(line))
        .map(|line| line.trim_end().to_string())
        .collect()
}

/// Collect `★ Insight` blocks verbatim: the marker line through the next
/// blank line.
pub fn extract_insights(output: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;

    for line in output.lines() {
        match &mut current {
            Some(block) => {
                if line.trim().is_empty() {
                    blocks.push(std::mem::take(block));
                    current = None;
                } else {
                    block.push('\n');
                    block.push_str(line.trim_end());
                }
            }
            None => {
                if line.contains(INSIGHT_MARKER) {
                    current = Some(line.trim_end().to_string());
                }
            }
        }
    }
    if let Some(block) = current {
        blocks.push(block);
    }
    blocks
}

fn is_artifact_line(line: &str) -> bool {
    let trimmed = line.trim();

    // cat -n style line numbers: 3-6 digits then a pipe.
    let leading_digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    if (3..=6).contains(&leading_digits.len())
        && trimmed[leading_digits.len()..].starts_with('|')
    {
        return true;
    }

    // Bare XML-like markers: `<thing>` or `</thing>` alone on a line.
    if trimmed.len() > 2 && trimmed.starts_with('<') && trimmed.ends_with('>') {
        let inner = trimmed[1..trimmed.len() - 1].trim_start_matches('/');
        if !inner.is_empty()
            && inner
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return true;
        }
    }

    // Bracket/punctuation-only artifacts.
    trimmed
        .chars()
        .all(|c| c.is_ascii_punctuation() || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_detection_is_case_insensitive() {
        assert!(contains_completion_marker("done <promise>COMPLETE</promise>"));
        assert!(contains_completion_marker("<Promise>complete</Promise>"));
        assert!(!contains_completion_marker("still working"));
    }

    #[test]
    fn extract_notes_cuts_at_marker_and_filters_artifacts() {
        let output = "\
working on the fix
  123|    let x = 1;
<system>
[{}]
real note about the change
<promise>COMPLETE</promise>
after marker is dropped
";
        let notes = extract_notes(output);
        assert_eq!(
            notes,
            vec![
                "working on the fix".to_string(),
                "real note about the change".to_string(),
            ]
        );
    }

    #[test]
    fn short_line_numbers_are_kept() {
        // Two digits is a legitimate sentence start, not a cat -n artifact.
        let notes = extract_notes("42| is not an artifact\n1234| is\n");
        assert_eq!(notes, vec!["42| is not an artifact".to_string()]);
    }

    #[test]
    fn insight_blocks_are_collected_verbatim() {
        let output = "\
noise
★ Insight: prefer the existing helper
it already handles retries

more noise
★ Insight: second one
";
        let insights = extract_insights(output);
        assert_eq!(insights.len(), 2);
        assert!(insights[0].contains("prefer the existing helper"));
        assert!(insights[0].contains("it already handles retries"));
        assert!(insights[1].contains("second one"));
    }

    #[test]
    fn first_write_creates_header_with_patterns_section() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log = ProgressLog::for_workspace(tmp.path());
        log.append_iteration(&IterationRecord {
            iteration: 1,
            success: true,
            task_id: "T1",
            task_title: "Add hello",
            duration_ms: 1500,
            output: "did the thing\n<promise>COMPLETE</promise>\n",
        })
        .unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.starts_with("# Progress Log"));
        assert!(contents.contains("## Codebase Patterns"));
        assert!(contents.contains("## ✓ Iteration 1 — T1: Add hello"));
        assert!(contents.contains("did the thing"));
        assert!(!contents.contains("COMPLETE</promise>"));
    }

    #[test]
    fn failed_iteration_uses_cross_heading() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log = ProgressLog::for_workspace(tmp.path());
        log.append_iteration(&IterationRecord {
            iteration: 2,
            success: false,
            task_id: "T2",
            task_title: "Broken",
            duration_ms: 100,
            output: "it failed\n",
        })
        .unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.contains("## ✗ Iteration 2 — T2: Broken"));
    }

    #[test]
    fn notes_are_limited_to_last_five_lines() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log = ProgressLog::for_workspace(tmp.path());
        let output = (1..=8)
            .map(|i| format!("note line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        log.append_iteration(&IterationRecord {
            iteration: 1,
            success: true,
            task_id: "T1",
            task_title: "Many notes",
            duration_ms: 10,
            output: &output,
        })
        .unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(!contents.contains("note line 3"));
        assert!(contents.contains("note line 4"));
        assert!(contents.contains("note line 8"));
    }

    #[test]
    fn recent_entries_returns_trailing_iterations() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log = ProgressLog::for_workspace(tmp.path());
        for i in 1..=5 {
            log.append_iteration(&IterationRecord {
                iteration: i,
                success: true,
                task_id: "T1",
                task_title: "Loop",
                duration_ms: 10,
                output: "fine\n",
            })
            .unwrap();
        }

        let recent = log.recent_entries(3);
        assert_eq!(recent.len(), 3);
        assert!(recent[0].contains("Iteration 3"));
        assert!(recent[2].contains("Iteration 5"));
    }

    #[test]
    fn patterns_roundtrip_through_add_and_read() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log = ProgressLog::for_workspace(tmp.path());
        log.add_pattern("error enums live next to their module").unwrap();
        log.add_pattern("tests use tempfile, never the real home dir").unwrap();

        let patterns = log.codebase_patterns();
        assert_eq!(patterns.len(), 2);
        assert!(patterns.contains(&"error enums live next to their module".to_string()));
    }

    #[test]
    fn insights_survive_into_the_log() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log = ProgressLog::for_workspace(tmp.path());
        log.append_iteration(&IterationRecord {
            iteration: 1,
            success: true,
            task_id: "T1",
            task_title: "Insightful",
            duration_ms: 10,
            output: "work\n★ Insight: cache the template registry\n\n<promise>COMPLETE</promise>\n",
        })
        .unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.contains("★ Insight: cache the template registry"));
    }
}
