//! Per-package outcomes and the run report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use super::error::PipelineFailure;
use super::stage::PackageState;

/// Comparator verdict for one channel: empty means equivalent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiffResult(String);

impl DiffResult {
    pub fn equivalent() -> Self {
        Self(String::new())
    }

    pub fn divergence(description: impl Into<String>) -> Self {
        Self(description.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DiffResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal classification of one processed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PackageOutcome {
    /// Both channel diffs are empty.
    Match,
    /// At least one channel diff is non-empty.
    Mismatch,
    /// The pipeline could not reach a comparison.
    Error(PipelineFailure),
}

impl PackageOutcome {
    pub fn classify(stdout_diff: &DiffResult, stderr_diff: &DiffResult) -> Self {
        if stdout_diff.is_empty() && stderr_diff.is_empty() {
            PackageOutcome::Match
        } else {
            PackageOutcome::Mismatch
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, PackageOutcome::Match)
    }

    /// Anything but `Match` counts as a finding for abort policies.
    pub fn is_finding(&self) -> bool {
        !self.is_match()
    }

    pub fn label(&self) -> &'static str {
        match self {
            PackageOutcome::Match => "MATCH",
            PackageOutcome::Mismatch => "MISMATCH",
            PackageOutcome::Error(_) => "ERROR",
        }
    }

    pub fn failure(&self) -> Option<&PipelineFailure> {
        match self {
            PackageOutcome::Error(f) => Some(f),
            _ => None,
        }
    }
}

/// Values printed by the install probe after each install.
///
/// Distinguishes an unmodified from a transformed installation; diagnostic only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMarkers {
    pub baseline: Option<String>,
    pub optimized: Option<String>,
}

/// Everything recorded for one processed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub package: String,
    pub outcome: PackageOutcome,
    pub stdout_diff: DiffResult,
    pub stderr_diff: DiffResult,
    #[serde(default)]
    pub markers: InstallMarkers,
    #[serde(default)]
    pub transitions: Vec<PackageState>,
    pub duration_ms: u64,
}

impl PackageRecord {
    /// A record for a package whose pipeline failed before comparison.
    pub fn errored(package: impl Into<String>, failure: PipelineFailure) -> Self {
        Self {
            package: package.into(),
            outcome: PackageOutcome::Error(failure),
            stdout_diff: DiffResult::equivalent(),
            stderr_diff: DiffResult::equivalent(),
            markers: InstallMarkers::default(),
            transitions: Vec::new(),
            duration_ms: 0,
        }
    }

    /// A record for a package that reached comparison.
    pub fn compared(package: impl Into<String>, stdout_diff: DiffResult, stderr_diff: DiffResult) -> Self {
        Self {
            package: package.into(),
            outcome: PackageOutcome::classify(&stdout_diff, &stderr_diff),
            stdout_diff,
            stderr_diff,
            markers: InstallMarkers::default(),
            transitions: Vec::new(),
            duration_ms: 0,
        }
    }

    /// (identifier, stdout diff, stderr diff)
    pub fn triple(&self) -> (&str, &str, &str) {
        (&self.package, self.stdout_diff.as_str(), self.stderr_diff.as_str())
    }
}

/// Ordered, append-only record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    aborted: bool,
    timed_out: bool,
    entries: Vec<PackageRecord>,
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            aborted: false,
            timed_out: false,
            entries: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Append a completed package. Entries are never modified afterwards.
    pub fn push(&mut self, record: PackageRecord) {
        self.entries.push(record);
    }

    /// Close the report.
    pub fn finish(&mut self, aborted: bool, timed_out: bool) {
        self.aborted = aborted;
        self.timed_out = timed_out;
        self.finished_at = Some(Utc::now());
    }

    pub fn entries(&self) -> &[PackageRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn matched(&self) -> usize {
        self.count(|o| matches!(o, PackageOutcome::Match))
    }

    pub fn mismatched(&self) -> usize {
        self.count(|o| matches!(o, PackageOutcome::Mismatch))
    }

    pub fn errored(&self) -> usize {
        self.count(|o| matches!(o, PackageOutcome::Error(_)))
    }

    fn count(&self, pred: impl Fn(&PackageOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }

    pub fn has_findings(&self) -> bool {
        self.entries.iter().any(|e| e.outcome.is_finding())
    }

    /// The report as (identifier, stdout diff, stderr diff) triples.
    pub fn triples(&self) -> Vec<(String, String, String)> {
        self.entries
            .iter()
            .map(|e| {
                let (name, out, err) = e.triple();
                (name.to_string(), out.to_string(), err.to_string())
            })
            .collect()
    }

    /// Write the report as pretty JSON.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}
