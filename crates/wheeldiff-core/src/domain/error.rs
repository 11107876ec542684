//! Error taxonomy for the differential pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::stage::{Stage, Variant};

/// Classification of a pipeline failure, attached to `Error` outcomes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Provisioning or driving the isolated environment failed.
    Environment,
    /// Source retrieval (or preparing the fetched tree) failed.
    Fetch,
    /// Building a distribution artifact failed (either variant).
    Build,
    /// Installing prerequisites or an artifact failed.
    Install,
    /// The test suite could not be run at all.
    TestExecution,
    /// The output comparator itself faulted.
    Comparison,
    /// A command or the whole package exceeded its time limit.
    Timeout,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Environment => "environment",
            ErrorKind::Fetch => "fetch",
            ErrorKind::Build => "build",
            ErrorKind::Install => "install",
            ErrorKind::TestExecution => "test_execution",
            ErrorKind::Comparison => "comparison",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A failure raised while a package moves through the pipeline.
///
/// Never escapes the package boundary: the runner converts it into a
/// [`PipelineFailure`] on an `Error` outcome.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("environment error: {0}")]
    Environment(String),

    #[error("fetching source failed: {0}")]
    Fetch(String),

    #[error("{variant} build failed: {reason}")]
    Build { variant: Variant, reason: String },

    #[error("install failed: {0}")]
    Install(String),

    #[error("test suite could not run: {0}")]
    TestExecution(String),

    #[error("comparator faulted: {0}")]
    Comparison(#[from] crate::compare::CompareError),

    #[error("{label} timed out after {limit_secs} seconds")]
    Timeout { label: String, limit_secs: u64 },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Environment(_) => ErrorKind::Environment,
            PipelineError::Fetch(_) => ErrorKind::Fetch,
            PipelineError::Build { .. } => ErrorKind::Build,
            PipelineError::Install(_) => ErrorKind::Install,
            PipelineError::TestExecution(_) => ErrorKind::TestExecution,
            PipelineError::Comparison(_) => ErrorKind::Comparison,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Build the error a failed `stage` raises, keeping its kind.
    pub fn for_stage(stage: Stage, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match stage.error_kind() {
            ErrorKind::Environment => PipelineError::Environment(reason),
            ErrorKind::Fetch => PipelineError::Fetch(reason),
            ErrorKind::Build => PipelineError::Build {
                variant: stage.variant().unwrap_or(Variant::Baseline),
                reason,
            },
            ErrorKind::Install => PipelineError::Install(reason),
            ErrorKind::TestExecution => PipelineError::TestExecution(reason),
            ErrorKind::Comparison => {
                PipelineError::Comparison(crate::compare::CompareError::Faulted(reason))
            }
            ErrorKind::Timeout => PipelineError::Timeout {
                label: stage.name().to_string(),
                limit_secs: 0,
            },
        }
    }

    /// Convert into the serializable failure record.
    pub fn into_failure(self, stage: Stage) -> PipelineFailure {
        PipelineFailure {
            stage,
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Diagnostics attached to an `Error` outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineFailure {
    /// Stage that failed.
    pub stage: Stage,
    /// Kind of failure.
    pub kind: ErrorKind,
    /// Human-readable error message.
    pub message: String,
}

impl std::fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error at {}: {}", self.kind, self.stage, self.message)
    }
}

/// Errors loading or validating the package catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("package {package}: empty source location")]
    MissingSource { package: String },

    #[error("package {package}: path {path:?} must be relative and stay inside the package tree")]
    InvalidPath { package: String, path: String },

    #[error("invalid package identifier {0:?}")]
    InvalidName(String),
}
