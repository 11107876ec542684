//! Structured observability hooks for run and package lifecycle events.
//!
//! This module provides:
//! - Package-scoped tracing spans via the `PackageSpan` RAII guard
//! - Emission functions for lifecycle events: run start/finish/abort,
//!   package start/stage/finish/skip
//!
//! Events are emitted at `info!` level unless noted; filter with `RUST_LOG`.

use tracing::{debug, info, warn};

use crate::domain::{PackageRecord, Stage};

/// RAII guard that enters a package-scoped span for the duration of its pipeline.
///
/// # Example
///
/// ```ignore
/// let _span = PackageSpan::enter("urllib3");
/// // every event until the guard drops carries package = "urllib3"
/// ```
pub struct PackageSpan {
    _span: tracing::span::EnteredSpan,
}

impl PackageSpan {
    pub fn enter(package: &str) -> Self {
        let span = tracing::info_span!("wheeldiff.package", package = %package);
        Self {
            _span: span.entered(),
        }
    }

    /// The span without entering it, for instrumenting futures.
    pub fn span(package: &str) -> tracing::Span {
        tracing::info_span!("wheeldiff.package", package = %package)
    }
}

pub fn emit_run_started(run_id: &str, packages: usize, workers: usize, isolation: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        packages = packages,
        workers = workers,
        isolation = %isolation,
    );
}

/// Emit event: run finished with counts per outcome.
pub fn emit_run_finished(
    run_id: &str,
    duration_ms: u64,
    matched: usize,
    mismatched: usize,
    errored: usize,
) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        matched = matched,
        mismatched = mismatched,
        errored = errored,
    );
}

/// Emit event: run stopped before the catalog was exhausted (warning level).
pub fn emit_run_aborted(run_id: &str, reason: &str) {
    warn!(event = "run.aborted", run_id = %run_id, reason = %reason);
}

pub fn emit_package_started(package: &str) {
    info!(event = "package.started", package = %package);
}

/// Emit event: a stage completed (debug level).
pub fn emit_package_stage(package: &str, stage: Stage, duration_ms: u64) {
    debug!(
        event = "package.stage",
        package = %package,
        stage = %stage,
        duration_ms = duration_ms,
    );
}

pub fn emit_package_finished(record: &PackageRecord) {
    let failure = record.outcome.failure().map(|f| f.to_string());
    info!(
        event = "package.finished",
        package = %record.package,
        outcome = record.outcome.label(),
        duration_ms = record.duration_ms,
        error = failure.as_deref().unwrap_or(""),
    );
}

pub fn emit_package_skipped(package: &str, reason: &str) {
    info!(event = "package.skipped", package = %package, reason = %reason);
}
