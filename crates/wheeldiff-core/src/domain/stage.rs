//! Pipeline stages and the per-package progress state machine.

use serde::{Deserialize, Serialize};

use super::error::ErrorKind;

/// Which of the two builds a stage belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Plain build, without the transformation under test.
    Baseline,
    /// Build produced through the transformation under test.
    Optimized,
}

impl Variant {
    pub fn name(&self) -> &'static str {
        match self {
            Variant::Baseline => "baseline",
            Variant::Optimized => "optimized",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One step of the differential sequence, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Acquire an isolated environment.
    Provision,
    /// Fetch package source into the environment.
    Fetch,
    /// Remove excluded test paths from the fetched tree.
    PruneTests,
    /// Install test prerequisites, declared requirements and the transformation tool.
    Prerequisites,
    BaselineBuild,
    BaselineInstall,
    BaselineTest,
    OptimizedBuild,
    OptimizedInstall,
    OptimizedTest,
    /// Compare baseline and optimized outputs.
    Compare,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::Provision,
        Stage::Fetch,
        Stage::PruneTests,
        Stage::Prerequisites,
        Stage::BaselineBuild,
        Stage::BaselineInstall,
        Stage::BaselineTest,
        Stage::OptimizedBuild,
        Stage::OptimizedInstall,
        Stage::OptimizedTest,
        Stage::Compare,
    ];

    /// Stable name, also used as the command sequence label.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Provision => "provision",
            Stage::Fetch => "fetch",
            Stage::PruneTests => "prune_tests",
            Stage::Prerequisites => "prerequisites",
            Stage::BaselineBuild => "baseline_build",
            Stage::BaselineInstall => "baseline_install",
            Stage::BaselineTest => "baseline_test",
            Stage::OptimizedBuild => "optimized_build",
            Stage::OptimizedInstall => "optimized_install",
            Stage::OptimizedTest => "optimized_test",
            Stage::Compare => "compare",
        }
    }

    /// Error kind raised when this stage fails (timeouts excepted).
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Stage::Provision => ErrorKind::Environment,
            Stage::Fetch | Stage::PruneTests => ErrorKind::Fetch,
            Stage::Prerequisites | Stage::BaselineInstall | Stage::OptimizedInstall => {
                ErrorKind::Install
            }
            Stage::BaselineBuild | Stage::OptimizedBuild => ErrorKind::Build,
            Stage::BaselineTest | Stage::OptimizedTest => ErrorKind::TestExecution,
            Stage::Compare => ErrorKind::Comparison,
        }
    }

    pub fn variant(&self) -> Option<Variant> {
        match self {
            Stage::BaselineBuild | Stage::BaselineInstall | Stage::BaselineTest => {
                Some(Variant::Baseline)
            }
            Stage::OptimizedBuild | Stage::OptimizedInstall | Stage::OptimizedTest => {
                Some(Variant::Optimized)
            }
            _ => None,
        }
    }

    /// Progress state reached when this stage completes, if it is a milestone.
    pub fn milestone(&self) -> Option<PackageState> {
        match self {
            Stage::Provision => Some(PackageState::EnvReady),
            Stage::BaselineInstall => Some(PackageState::BaselineBuilt),
            Stage::BaselineTest => Some(PackageState::BaselineTested),
            Stage::OptimizedInstall => Some(PackageState::OptimizedBuilt),
            Stage::OptimizedTest => Some(PackageState::OptimizedTested),
            Stage::Compare => Some(PackageState::Compared),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Progress of one package through the pipeline.
///
/// ```text
/// Pending -> Skipped | Active
/// Active -> EnvReady -> BaselineBuilt -> BaselineTested
///        -> OptimizedBuilt -> OptimizedTested -> Compared -> Done
/// any state before Compared -> Error -> Done
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    Pending,
    Skipped,
    Active,
    EnvReady,
    BaselineBuilt,
    BaselineTested,
    OptimizedBuilt,
    OptimizedTested,
    Compared,
    Done,
    Error,
}

impl PackageState {
    pub fn can_transition_to(self, next: PackageState) -> bool {
        use PackageState::*;
        matches!(
            (self, next),
            (Pending, Skipped)
                | (Pending, Active)
                | (Active, EnvReady)
                | (EnvReady, BaselineBuilt)
                | (BaselineBuilt, BaselineTested)
                | (BaselineTested, OptimizedBuilt)
                | (OptimizedBuilt, OptimizedTested)
                | (OptimizedTested, Compared)
                | (Compared, Done)
                | (Error, Done)
        ) || (next == Error && self.precedes_comparison())
    }

    fn precedes_comparison(self) -> bool {
        use PackageState::*;
        matches!(
            self,
            Active | EnvReady | BaselineBuilt | BaselineTested | OptimizedBuilt | OptimizedTested
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PackageState::Done | PackageState::Skipped)
    }
}

/// Records the states a package went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressTracker {
    current: PackageState,
    log: Vec<PackageState>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            current: PackageState::Pending,
            log: vec![PackageState::Pending],
        }
    }

    pub fn current(&self) -> PackageState {
        self.current
    }

    /// Move to `next`. Returns `false` (and stays put) on an illegal transition.
    pub fn advance(&mut self, next: PackageState) -> bool {
        if !self.current.can_transition_to(next) {
            tracing::warn!(from = ?self.current, to = ?next, "Illegal package state transition");
            return false;
        }
        self.current = next;
        self.log.push(next);
        true
    }

    pub fn into_log(self) -> Vec<PackageState> {
        self.log
    }
}
