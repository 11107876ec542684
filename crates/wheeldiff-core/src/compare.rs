//! Output comparison between baseline and optimized test runs.
//!
//! Raw test output is never byte-identical across two builds: addresses,
//! timings, temp directories and the representation of compiled objects all
//! vary. [`LineComparator`] normalizes each side line by line, then renders
//! whatever still differs as a unified diff.

use regex::Regex;
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use thiserror::Error;

use crate::domain::DiffResult;

/// Context lines around each hunk of a rendered diff.
pub const DIFF_CONTEXT_LINES: usize = 3;

/// Which output stream is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Channel::Stdout => "stdout",
            Channel::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Channel::Stdout),
            "stderr" => Ok(Channel::Stderr),
            other => Err(format!("unknown channel {other:?} (expected stdout or stderr)")),
        }
    }
}

/// Comparison switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareFlags {
    /// Drop warning-level lines before comparing.
    pub ignore_warnings: bool,
    /// Drop info-level lines before comparing.
    pub ignore_infos: bool,
    /// Collapse a side containing a syntax error to that line.
    pub syntax_errors_hard: bool,
}

impl Default for CompareFlags {
    fn default() -> Self {
        Self {
            ignore_warnings: true,
            ignore_infos: true,
            syntax_errors_hard: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum CompareError {
    #[error("invalid comparator pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("{0}")]
    Faulted(String),
}

/// Decides whether two captured outputs are equivalent.
///
/// Implementations must be pure: the same inputs always give the same result.
pub trait OutputComparator: Send + Sync {
    fn compare(
        &self,
        channel: Channel,
        baseline: &str,
        optimized: &str,
        flags: CompareFlags,
    ) -> Result<DiffResult, CompareError>;
}

const WARNING_PATTERN: &str = r"^(?:[\w.\-]+:)?WARNING\b|\b\w*Warning: ";
const INFO_PATTERN: &str = r"^(?:[\w.\-]+:)?INFO\b";
const SYNTAX_ERROR_PATTERN: &str = r"(?:^|[\s:])SyntaxError:";

/// Substitutions applied to every kept line, in order.
const MASKS: &[(&str, &str)] = &[
    (r"\bcompiled_(function|method|generator|coroutine|asyncgen|frame|cell)\b", "$1"),
    (r"<module '([\w.]+)' (?:from '[^']*'|\(built-in\))>", "<module '$1'>"),
    (r"\bThread 0x[0-9a-fA-F]+", "Thread 0x<tid>"),
    (r"\bat 0x[0-9a-fA-F]+", "at 0x<addr>"),
    (r"\b0x[0-9a-fA-F]{6,}\b", "0x<addr>"),
    (r"\bRan (\d+) tests? in \d+(?:\.\d+)?s", "Ran $1 tests in <t>s"),
    (r"\bin \d+(?:\.\d+)?s(?: \(\d+:\d{2}:\d{2}\))?", "in <t>s"),
    (r"\b\d+(?:\.\d+)? seconds\b", "<t> seconds"),
    (r#"File "([^"]+)", line \d+"#, r#"File "$1", line <n>"#),
    (r"/tmp/tmp[\w\-]+", "/tmp/<tmp>"),
    (r"\bpytest-(\d+)\b", "pytest-<n>"),
    (r"\b(127\.0\.0\.1|localhost):\d+", "$1:<port>"),
];

/// Lines dropped regardless of flags.
const NOISE_LINES: &[&str] = &[
    r"^REFCOUNTS",
    r"^\[\d+ refs(?:, \d+ blocks)?\]$",
    // caret and tilde markers under a source line; also matches blank lines
    r"^\s*~*\^*~*$",
];

/// Default [`OutputComparator`]: line normalization plus a unified diff.
#[derive(Debug, Clone)]
pub struct LineComparator {
    warning: Regex,
    info: Regex,
    syntax_error: Regex,
    terminal_prefix: Regex,
    noise: Vec<Regex>,
    masks: Vec<(Regex, &'static str)>,
}

impl LineComparator {
    pub fn new() -> Result<Self, CompareError> {
        Ok(Self {
            warning: Regex::new(WARNING_PATTERN)?,
            info: Regex::new(INFO_PATTERN)?,
            syntax_error: Regex::new(SYNTAX_ERROR_PATTERN)?,
            terminal_prefix: Regex::new(r"^\x1b\[[0-9;?]*h")?,
            noise: NOISE_LINES
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<_, _>>()?,
            masks: MASKS
                .iter()
                .map(|(p, r)| Regex::new(p).map(|re| (re, *r)))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Replace the pattern recognising warning lines.
    pub fn with_warning_pattern(mut self, pattern: &str) -> Result<Self, CompareError> {
        self.warning = Regex::new(pattern)?;
        Ok(self)
    }

    /// Replace the pattern recognising info lines.
    pub fn with_info_pattern(mut self, pattern: &str) -> Result<Self, CompareError> {
        self.info = Regex::new(pattern)?;
        Ok(self)
    }

    fn syntax_error_line<'a>(&self, text: &'a str) -> Option<&'a str> {
        text.lines().find(|line| self.syntax_error.is_match(line))
    }

    /// Normalize one side into comparable text (one line per kept line).
    pub fn normalize(&self, text: &str, flags: CompareFlags) -> String {
        let text = self.terminal_prefix.replace(text, "");
        if flags.syntax_errors_hard {
            if let Some(line) = self.syntax_error_line(&text) {
                return format!("{}\n", line.trim_end_matches('\r'));
            }
        }

        let mut out = String::with_capacity(text.len());
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if self.noise.iter().any(|re| re.is_match(line)) {
                continue;
            }
            if flags.ignore_warnings && self.warning.is_match(line) {
                continue;
            }
            if flags.ignore_infos && self.info.is_match(line) {
                continue;
            }
            let mut masked = std::borrow::Cow::Borrowed(line);
            for (re, replacement) in &self.masks {
                if re.is_match(&masked) {
                    masked = std::borrow::Cow::Owned(re.replace_all(&masked, *replacement).into_owned());
                }
            }
            out.push_str(&masked);
            out.push('\n');
        }
        out
    }
}

impl OutputComparator for LineComparator {
    fn compare(
        &self,
        channel: Channel,
        baseline: &str,
        optimized: &str,
        flags: CompareFlags,
    ) -> Result<DiffResult, CompareError> {
        let one_sided = match (
            self.syntax_error_line(baseline),
            self.syntax_error_line(optimized),
        ) {
            (Some(line), None) => Some(("baseline", line)),
            (None, Some(line)) => Some(("optimized", line)),
            _ => None,
        };

        let left = self.normalize(baseline, flags);
        let right = self.normalize(optimized, flags);
        if left == right && one_sided.is_none() {
            return Ok(DiffResult::equivalent());
        }

        let mut rendered = String::new();
        if let Some((side, line)) = one_sided {
            rendered.push_str(&format!(
                "SyntaxError only in {side} output: {}\n",
                line.trim()
            ));
        }
        if left != right {
            let old_header = format!("baseline ({channel})");
            let new_header = format!("optimized ({channel})");
            let diff = TextDiff::from_lines(left.as_str(), right.as_str());
            rendered.push_str(
                &diff
                    .unified_diff()
                    .context_radius(DIFF_CONTEXT_LINES)
                    .header(&old_header, &new_header)
                    .to_string(),
            );
        }
        Ok(DiffResult::divergence(rendered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp() -> LineComparator {
        LineComparator::new().unwrap()
    }

    fn diff(a: &str, b: &str) -> DiffResult {
        cmp()
            .compare(Channel::Stdout, a, b, CompareFlags::default())
            .unwrap()
    }

    #[test]
    fn test_identical_outputs_are_equivalent() {
        let out = "collected 3 items\n\ntests/test_a.py ...\n\n3 passed in 0.12s\n";
        assert!(diff(out, out).is_empty());
    }

    #[test]
    fn test_timings_and_addresses_are_masked() {
        let a = "<Foo object at 0x7f3a2c1d9e80>\n=== 3 passed in 0.12s ===\nRan 4 tests in 0.003s\n";
        let b = "<Foo object at 0x7f11aa02b3c0>\n=== 3 passed in 1.70s ===\nRan 4 tests in 0.101s\n";
        assert!(diff(a, b).is_empty());
    }

    #[test]
    fn test_compiled_types_are_masked() {
        let a = "<class 'function'>\n<module 'idna' from '/a/site-packages/idna/__init__.py'>\n";
        let b = "<class 'compiled_function'>\n<module 'idna' from '/b/site-packages/idna/__init__.so'>\n";
        assert!(diff(a, b).is_empty());
    }

    #[test]
    fn test_ports_and_temp_paths_are_masked() {
        let a = "connected to 127.0.0.1:40121 in /tmp/tmpa81kz_\n";
        let b = "connected to 127.0.0.1:51733 in /tmp/tmpq0c2lm\n";
        assert!(diff(a, b).is_empty());
    }

    #[test]
    fn test_warnings_ignored_by_flag() {
        let a = "1 passed\n";
        let b = "DeprecationWarning: x is deprecated\n1 passed\n";
        assert!(diff(a, b).is_empty());

        let strict = CompareFlags {
            ignore_warnings: false,
            ..CompareFlags::default()
        };
        let result = cmp().compare(Channel::Stderr, a, b, strict).unwrap();
        assert!(!result.is_empty());
        assert!(result.as_str().contains("+DeprecationWarning"));
    }

    #[test]
    fn test_info_lines_ignored_by_flag() {
        assert!(diff("ok\n", "INFO: cache hit\nok\n").is_empty());
    }

    #[test]
    fn test_refcount_and_caret_lines_dropped() {
        let a = "line\n";
        let b = "[42 refs]\nline\n    ^^^^\n\r\n";
        assert!(diff(a, b).is_empty());
    }

    #[test]
    fn test_divergence_renders_unified_diff() {
        let result = diff("a\nb\nc\n", "a\nB\nc\n");
        let text = result.as_str();
        assert!(text.contains("--- baseline (stdout)"));
        assert!(text.contains("+++ optimized (stdout)"));
        assert!(text.contains("-b"));
        assert!(text.contains("+B"));
    }

    #[test]
    fn test_one_sided_syntax_error_regardless_of_flags() {
        let good = "1 passed\n";
        let bad = "  File \"x.py\", line 3\nSyntaxError: invalid syntax\n";
        for hard in [true, false] {
            let flags = CompareFlags {
                ignore_warnings: true,
                ignore_infos: true,
                syntax_errors_hard: hard,
            };
            let result = cmp().compare(Channel::Stdout, good, bad, flags).unwrap();
            assert!(!result.is_empty(), "hard={hard}");
            assert!(result.as_str().starts_with("SyntaxError only in optimized output"));
        }
    }

    #[test]
    fn test_same_syntax_error_on_both_sides_collapses() {
        let a = "noise 1\nSyntaxError: invalid syntax\n";
        let b = "noise 2\nother\nSyntaxError: invalid syntax\n";
        assert!(diff(a, b).is_empty());
    }

    #[test]
    fn test_compare_is_pure() {
        let c = cmp();
        let a = "x = 1\n";
        let b = "x = 2\n";
        let first = c.compare(Channel::Stdout, a, b, CompareFlags::default()).unwrap();
        let second = c.compare(Channel::Stdout, a, b, CompareFlags::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_channel_from_str() {
        assert_eq!("stderr".parse::<Channel>().unwrap(), Channel::Stderr);
        assert!("both".parse::<Channel>().is_err());
    }
}
