//! Run gate: turns a report into a pass/fail verdict and exit code.

use serde::{Deserialize, Serialize};
use wheeldiff_core::{PackageOutcome, RunReport};

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// One entry per package that did not match (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

impl GateVerdict {
    /// Process exit code: 0 when every package matched, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.passed {
            0
        } else {
            1
        }
    }
}

/// Run gate rules.
pub struct RunGate;

impl RunGate {
    /// Every recorded package must be a `Match` and the run must not have
    /// hit its time limit. An empty report passes.
    pub fn evaluate(report: &RunReport) -> GateVerdict {
        let mut violations: Vec<String> = report
            .entries()
            .iter()
            .filter_map(|entry| match &entry.outcome {
                PackageOutcome::Match => None,
                PackageOutcome::Mismatch => {
                    let channels: Vec<&str> = [
                        ("stdout", &entry.stdout_diff),
                        ("stderr", &entry.stderr_diff),
                    ]
                    .into_iter()
                    .filter(|(_, diff)| !diff.is_empty())
                    .map(|(name, _)| name)
                    .collect();
                    Some(format!(
                        "Package '{}' outputs differed ({})",
                        entry.package,
                        channels.join(", ")
                    ))
                }
                PackageOutcome::Error(failure) => {
                    Some(format!("Package '{}' failed: {}", entry.package, failure))
                }
            })
            .collect();
        if report.timed_out() {
            violations.push("Run stopped at its time limit".to_string());
        }

        let passed = violations.is_empty();
        let message = if passed {
            format!("All {} package(s) matched", report.len())
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }
}
