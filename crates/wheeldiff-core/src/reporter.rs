//! Console reporting for differential runs.
//!
//! Provides two outputs for the operator:
//! - a framed status block per package, printed as soon as it completes
//! - a summary over the whole [`RunReport`], in recorded order

use std::io::{self, Write};
use std::str::FromStr;

use thiserror::Error;

use crate::domain::{DiffResult, PackageOutcome, PackageRecord, RunReport};

// ── styles ────────────────────────────────────────────────────────────────

/// Closed set of console styles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Style {
    Pink,
    Blue,
    Green,
    Yellow,
    Red,
    Bold,
    Underline,
    Reset,
}

impl Style {
    /// ANSI escape sequence for the style.
    pub fn code(&self) -> &'static str {
        match self {
            Style::Pink => "\x1b[95m",
            Style::Blue => "\x1b[94m",
            Style::Green => "\x1b[92m",
            Style::Yellow => "\x1b[93m",
            Style::Red => "\x1b[91m",
            Style::Bold => "\x1b[1m",
            Style::Underline => "\x1b[4m",
            Style::Reset => "\x1b[0m",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0:?} is not a valid style")]
pub struct UnknownStyle(pub String);

impl FromStr for Style {
    type Err = UnknownStyle;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pink" => Ok(Style::Pink),
            "blue" => Ok(Style::Blue),
            "green" => Ok(Style::Green),
            "yellow" => Ok(Style::Yellow),
            "red" => Ok(Style::Red),
            "bold" => Ok(Style::Bold),
            "underline" => Ok(Style::Underline),
            "reset" => Ok(Style::Reset),
            other => Err(UnknownStyle(other.to_string())),
        }
    }
}

const SEPARATOR_WIDTH: usize = 81;

fn presence(diff: &DiffResult) -> &'static str {
    if diff.is_empty() {
        "clean"
    } else {
        "differs"
    }
}

// ── reporter ──────────────────────────────────────────────────────────────

/// Writes package status blocks and the run summary to `out`.
pub struct Reporter<W: Write> {
    out: W,
    color: bool,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W, color: bool) -> Self {
        Self { out, color }
    }

    fn styled(&mut self, style: Style, text: &str) -> io::Result<()> {
        if self.color {
            writeln!(self.out, "{}{}{}", style.code(), text, Style::Reset.code())
        } else {
            writeln!(self.out, "{text}")
        }
    }

    /// Print the status block of a finished package.
    pub fn package_finished(&mut self, record: &PackageRecord) -> io::Result<()> {
        let style = if record.outcome.is_match() {
            Style::Green
        } else {
            Style::Red
        };
        self.styled(style, &format!("\n{}", "=".repeat(SEPARATOR_WIDTH)))?;
        self.styled(
            style,
            &format!(
                "--- {} --- exit_stdout: {} exit_stderr: {}",
                record.package,
                u8::from(!record.stdout_diff.is_empty()),
                u8::from(!record.stderr_diff.is_empty()),
            ),
        )?;
        for diff in [&record.stdout_diff, &record.stderr_diff] {
            if !diff.is_empty() {
                write!(self.out, "{diff}")?;
                if !diff.as_str().ends_with('\n') {
                    writeln!(self.out)?;
                }
            }
        }
        match &record.outcome {
            PackageOutcome::Match => self.styled(
                Style::Green,
                &format!("No differences found for package {}.", record.package),
            )?,
            PackageOutcome::Mismatch => self.styled(
                Style::Red,
                &format!("Error, outputs differed for package {}.", record.package),
            )?,
            PackageOutcome::Error(failure) => self.styled(
                Style::Red,
                &format!("Package {} could not be compared: {failure}", record.package),
            )?,
        }
        self.out.flush()
    }

    /// Print the notice for a package excluded by policy.
    pub fn package_skipped(&mut self, package: &str, reason: &str) -> io::Result<()> {
        self.styled(Style::Yellow, &format!("Skipping {package}: {reason}"))?;
        self.out.flush()
    }

    /// Print the run summary, one line per recorded package.
    pub fn summary(&mut self, report: &RunReport) -> io::Result<()> {
        let rule = "=".repeat((SEPARATOR_WIDTH - "SUMMARY".len()) / 2);
        self.styled(Style::Bold, &format!("\n\n{rule}SUMMARY{rule}"))?;

        for entry in report.entries() {
            let style = if entry.outcome.is_match() { Style::Green } else { Style::Red };
            let mut line = format!(
                "{} - stdout: {} stderr: {}",
                entry.package,
                presence(&entry.stdout_diff),
                presence(&entry.stderr_diff),
            );
            if let PackageOutcome::Error(failure) = &entry.outcome {
                line.push_str(&format!(" - {failure}"));
            }
            self.styled(style, &line)?;
        }

        self.styled(
            Style::Blue,
            &format!(
                "{} packages: {} matched, {} mismatched, {} errored",
                report.len(),
                report.matched(),
                report.mismatched(),
                report.errored(),
            ),
        )?;
        if report.timed_out() {
            self.styled(Style::Yellow, "Run stopped: time limit reached.")?;
        } else if report.aborted() {
            self.styled(Style::Yellow, "Run stopped early after a finding.")?;
        }
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
