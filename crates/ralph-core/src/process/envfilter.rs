//! Environment filtering for agent subprocesses.
//!
//! A pure function over an input map: nothing here reads or mutates the
//! real process environment. Keys matching an exclude pattern are dropped
//! unless a passthrough pattern explicitly re-admits them.

use std::collections::HashMap;

use glob::{MatchOptions, Pattern, PatternError};

/// Patterns applied by every agent adapter unless overridden.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "*_API_KEY",
    "*_SECRET_KEY",
    "*_SECRET",
    "*_TOKEN",
    "*_PASSWORD",
];

/// Compiled exclude + passthrough pattern sets.
#[derive(Debug, Clone)]
pub struct EnvFilter {
    exclude: Vec<Pattern>,
    passthrough: Vec<Pattern>,
}

/// Startup diagnostic: which keys of a given environment would be blocked.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnvReport {
    /// Keys dropped by the filter, sorted.
    pub blocked: Vec<String>,
    /// Keys that matched an exclude pattern but were re-admitted by a
    /// passthrough pattern, sorted.
    pub allowed: Vec<String>,
}

/// Env var names compare case-insensitively on Windows.
fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: !cfg!(windows),
        require_literal_separator: false,
        require_literal_leading_dot: false,
    }
}

impl EnvFilter {
    /// Compile a filter from raw glob strings (`*` and `?` wildcards).
    pub fn new(exclude: &[String], passthrough: &[String]) -> Result<Self, PatternError> {
        Ok(Self {
            exclude: exclude
                .iter()
                .map(|p| Pattern::new(p))
                .collect::<Result<_, _>>()?,
            passthrough: passthrough
                .iter()
                .map(|p| Pattern::new(p))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Compile the default exclude set plus user additions.
    pub fn with_defaults(
        extra_exclude: &[String],
        passthrough: &[String],
    ) -> Result<Self, PatternError> {
        let mut exclude: Vec<String> =
            DEFAULT_EXCLUDES.iter().map(|p| p.to_string()).collect();
        exclude.extend(extra_exclude.iter().cloned());
        Self::new(&exclude, passthrough)
    }

    fn matches_exclude(&self, key: &str) -> bool {
        let opts = match_options();
        self.exclude.iter().any(|p| p.matches_with(key, opts))
    }

    fn matches_passthrough(&self, key: &str) -> bool {
        let opts = match_options();
        self.passthrough.iter().any(|p| p.matches_with(key, opts))
    }

    /// A key is kept iff it matches no exclude pattern, or matches any
    /// passthrough pattern.
    pub fn is_kept(&self, key: &str) -> bool {
        !self.matches_exclude(key) || self.matches_passthrough(key)
    }

    /// Return a copy of `env` with blocked keys removed.
    pub fn filter(&self, env: &HashMap<String, String>) -> HashMap<String, String> {
        env.iter()
            .filter(|(key, _)| self.is_kept(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Report which keys of `env` are blocked, and which matched an exclude
    /// pattern but are let through.
    pub fn report(&self, env: &HashMap<String, String>) -> EnvReport {
        let mut blocked = Vec::new();
        let mut allowed = Vec::new();
        for key in env.keys() {
            if self.matches_exclude(key) {
                if self.matches_passthrough(key) {
                    allowed.push(key.clone());
                } else {
                    blocked.push(key.clone());
                }
            }
        }
        blocked.sort();
        allowed.sort();
        EnvReport { blocked, allowed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_excludes_block_common_secrets() {
        let filter = EnvFilter::with_defaults(&[], &[]).unwrap();
        let input = env(&[
            ("FOO", "ok"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("AWS_SECRET_KEY", "x"),
            ("DB_SECRET", "x"),
            ("GITHUB_TOKEN", "x"),
            ("ROOT_PASSWORD", "x"),
        ]);

        let filtered = filter.filter(&input);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("FOO"));
    }

    #[test]
    fn report_is_sorted_and_split() {
        let filter =
            EnvFilter::with_defaults(&[], &strings(&["ANTHROPIC_API_KEY"])).unwrap();
        let input = env(&[
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("GITHUB_TOKEN", "x"),
            ("AWS_SECRET_KEY", "x"),
            ("FOO", "ok"),
        ]);

        let report = filter.report(&input);
        assert_eq!(report.blocked, strings(&["AWS_SECRET_KEY", "GITHUB_TOKEN"]));
        assert_eq!(report.allowed, strings(&["ANTHROPIC_API_KEY"]));
    }

    #[test]
    fn passthrough_wins_over_exclude() {
        let filter = EnvFilter::new(
            &strings(&["*_TOKEN"]),
            &strings(&["CI_TOKEN"]),
        )
        .unwrap();

        let input = env(&[("CI_TOKEN", "keep"), ("GITHUB_TOKEN", "drop")]);
        let filtered = filter.filter(&input);
        assert!(filtered.contains_key("CI_TOKEN"));
        assert!(!filtered.contains_key("GITHUB_TOKEN"));
    }

    #[test]
    fn question_mark_matches_exactly_one_char() {
        let filter = EnvFilter::new(&strings(&["VAR_?"]), &[]).unwrap();
        assert!(!filter.is_kept("VAR_A"));
        assert!(filter.is_kept("VAR_AB"));
        assert!(filter.is_kept("VAR_"));
    }

    #[cfg(not(windows))]
    #[test]
    fn matching_is_case_sensitive_on_unix() {
        let filter = EnvFilter::new(&strings(&["*_TOKEN"]), &[]).unwrap();
        assert!(!filter.is_kept("GITHUB_TOKEN"));
        assert!(filter.is_kept("github_token"));
    }

    #[test]
    fn empty_patterns_keep_everything() {
        let filter = EnvFilter::new(&[], &[]).unwrap();
        let input = env(&[("ANTHROPIC_API_KEY", "sk-ant"), ("FOO", "ok")]);
        assert_eq!(filter.filter(&input).len(), 2);
        assert_eq!(filter.report(&input), EnvReport::default());
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(EnvFilter::new(&strings(&["[unclosed"]), &[]).is_err());
    }

    #[test]
    fn filter_does_not_touch_the_input_map() {
        let filter = EnvFilter::with_defaults(&[], &[]).unwrap();
        let input = env(&[("MY_TOKEN", "x"), ("FOO", "ok")]);
        let _ = filter.filter(&input);
        assert_eq!(input.len(), 2, "input map must be unchanged");
    }
}
