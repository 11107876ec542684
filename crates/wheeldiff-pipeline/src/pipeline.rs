//! Differential pipeline: per-package runner and the run loop.

use std::any::Any;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::FutureExt;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn, Instrument};
use wheeldiff_core::obs::{
    emit_package_finished, emit_package_skipped, emit_package_started, emit_run_aborted,
    emit_run_finished, emit_run_started, PackageSpan,
};
use wheeldiff_core::{
    Channel, CompareFlags, CursorState, DiffResult, InstallMarkers, IterationController,
    OutputComparator, PackageCatalog, PackageDescriptor, PackageRecord, PackageState,
    PipelineError, PipelineFailure, ProgressTracker, Reporter, RunReport, Stage, Variant,
};
use wheeldiff_env::{CapturedOutput, EnvHandle, EnvResult, EnvironmentManager};

use crate::runner::{stage_error, StageRunner};
use crate::spec::{IsolationMode, RunSpec};
use crate::stage::{probe_sequence, variant_stages, StagePlan, PREPARE_STAGES};

/// Replaces the environment root in captured output before comparison.
pub const ENV_PLACEHOLDER: &str = "<env>";

/// Owns a live environment and destroys it when dropped.
///
/// Teardown therefore happens on every exit path: success, error, panic,
/// timeout and task cancellation.
pub struct EnvGuard {
    env: Arc<dyn EnvironmentManager>,
    handle: EnvHandle,
}

impl EnvGuard {
    pub async fn create(env: Arc<dyn EnvironmentManager>, name: &str) -> EnvResult<Self> {
        let handle = env.create(name).await?;
        debug!(env = %handle, root = %handle.root().display(), "Environment ready");
        Ok(Self { env, handle })
    }

    pub fn handle(&self) -> &EnvHandle {
        &self.handle
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        let multi_thread = Handle::try_current()
            .is_ok_and(|rt| rt.runtime_flavor() == RuntimeFlavor::MultiThread);
        if multi_thread {
            // teardown stays synchronous; other tasks move off this worker meanwhile
            tokio::task::block_in_place(|| self.env.destroy(&self.handle));
        } else {
            self.env.destroy(&self.handle);
        }
    }
}

/// Where a package currently is; survives cancellation of the pipeline future.
struct Progress {
    tracker: ProgressTracker,
    stage: Stage,
    markers: InstallMarkers,
}

impl Progress {
    fn new() -> Self {
        let mut tracker = ProgressTracker::new();
        tracker.advance(PackageState::Active);
        Self {
            tracker,
            stage: Stage::Provision,
            markers: InstallMarkers::default(),
        }
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
    }

    fn reach(&mut self, stage: Stage) {
        // the second provision under split isolation is not a new milestone
        if let Some(next) = stage.milestone() {
            if self.tracker.current().can_transition_to(next) {
                self.tracker.advance(next);
            }
        }
    }
}

/// Runs the differential sequence for single packages.
pub struct DifferentialRunner {
    env: Arc<dyn EnvironmentManager>,
    comparator: Arc<dyn OutputComparator>,
    spec: RunSpec,
    flags: CompareFlags,
}

impl DifferentialRunner {
    pub fn new(
        env: Arc<dyn EnvironmentManager>,
        comparator: Arc<dyn OutputComparator>,
        spec: RunSpec,
    ) -> Self {
        Self {
            env,
            comparator,
            spec,
            flags: CompareFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: CompareFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn spec(&self) -> &RunSpec {
        &self.spec
    }

    /// Run the whole sequence for `package`. Never fails: errors become an `Error` outcome.
    pub async fn run_package(&self, package: &PackageDescriptor) -> PackageRecord {
        let start = Instant::now();
        emit_package_started(&package.name);
        let mut progress = Progress::new();

        let result = match self.spec.package_timeout_secs {
            0 => self.differential(package, &mut progress).await,
            limit => {
                let run = self.differential(package, &mut progress);
                match tokio::time::timeout(Duration::from_secs(limit), run).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::Timeout {
                        label: format!("package {}", package.name),
                        limit_secs: limit,
                    }),
                }
            }
        };

        let mut record = match result {
            Ok((stdout_diff, stderr_diff)) => {
                progress.tracker.advance(PackageState::Done);
                PackageRecord::compared(&package.name, stdout_diff, stderr_diff)
            }
            Err(err) => {
                warn!(package = %package.name, stage = %progress.stage, error = %err, "Package pipeline failed");
                progress.tracker.advance(PackageState::Error);
                progress.tracker.advance(PackageState::Done);
                PackageRecord::errored(&package.name, err.into_failure(progress.stage))
            }
        };
        record.markers = progress.markers;
        record.transitions = progress.tracker.into_log();
        record.duration_ms = start.elapsed().as_millis() as u64;
        emit_package_finished(&record);
        record
    }

    async fn differential(
        &self,
        package: &PackageDescriptor,
        progress: &mut Progress,
    ) -> Result<(DiffResult, DiffResult), PipelineError> {
        let (baseline, optimized) = match self.spec.isolation {
            IsolationMode::Split => {
                let baseline = {
                    let guard = self.provision(&format!("{}-baseline", package.name), progress).await?;
                    self.prepare(&guard, package, progress).await?;
                    self.build_and_test(&guard, package, Variant::Baseline, progress).await?
                };
                let guard = self.provision(&format!("{}-optimized", package.name), progress).await?;
                self.prepare(&guard, package, progress).await?;
                let optimized = self.build_and_test(&guard, package, Variant::Optimized, progress).await?;
                (baseline, optimized)
            }
            IsolationMode::Shared => {
                let guard = self.provision(&package.name, progress).await?;
                self.prepare(&guard, package, progress).await?;
                let baseline = self.build_and_test(&guard, package, Variant::Baseline, progress).await?;
                let optimized = self.build_and_test(&guard, package, Variant::Optimized, progress).await?;
                (baseline, optimized)
            }
        };

        progress.enter(Stage::Compare);
        let stdout_diff = self.comparator.compare(
            Channel::Stdout,
            &baseline.stdout,
            &optimized.stdout,
            self.flags,
        )?;
        let stderr_diff = self.comparator.compare(
            Channel::Stderr,
            &baseline.stderr,
            &optimized.stderr,
            self.flags,
        )?;
        progress.reach(Stage::Compare);
        Ok((stdout_diff, stderr_diff))
    }

    async fn provision(&self, name: &str, progress: &mut Progress) -> Result<EnvGuard, PipelineError> {
        progress.enter(Stage::Provision);
        let guard = EnvGuard::create(Arc::clone(&self.env), name)
            .await
            .map_err(|e| stage_error(Stage::Provision, e))?;
        progress.reach(Stage::Provision);
        Ok(guard)
    }

    fn plan(&self, stage: Stage, package: &PackageDescriptor) -> Option<StagePlan> {
        StagePlan::for_stage(
            stage,
            package,
            &self.spec.toolchain,
            self.spec.command_timeout_secs,
        )
    }

    async fn step(
        &self,
        guard: &EnvGuard,
        package: &PackageDescriptor,
        stage: Stage,
        progress: &mut Progress,
    ) -> Result<(), PipelineError> {
        let Some(plan) = self.plan(stage, package) else {
            return Ok(());
        };
        progress.enter(stage);
        StageRunner::new(self.env.as_ref(), guard.handle(), &package.name)
            .execute(&plan)
            .await?;
        progress.reach(stage);
        Ok(())
    }

    /// Fetch the source, prune excluded tests and install prerequisites.
    async fn prepare(
        &self,
        guard: &EnvGuard,
        package: &PackageDescriptor,
        progress: &mut Progress,
    ) -> Result<(), PipelineError> {
        for stage in PREPARE_STAGES {
            self.step(guard, package, stage, progress).await?;
        }
        Ok(())
    }

    /// Build, install and test one variant; returns the relativized test output.
    async fn build_and_test(
        &self,
        guard: &EnvGuard,
        package: &PackageDescriptor,
        variant: Variant,
        progress: &mut Progress,
    ) -> Result<CapturedOutput, PipelineError> {
        let [build, install, test] = variant_stages(variant);
        self.step(guard, package, build, progress).await?;
        self.step(guard, package, install, progress).await?;

        let runner = StageRunner::new(self.env.as_ref(), guard.handle(), &package.name);
        let marker = runner
            .probe(&probe_sequence(package, variant, self.spec.command_timeout_secs))
            .await;
        match variant {
            Variant::Baseline => progress.markers.baseline = marker,
            Variant::Optimized => progress.markers.optimized = marker,
        }

        progress.enter(test);
        let plan = self
            .plan(test, package)
            .ok_or_else(|| PipelineError::for_stage(test, "no test command configured"))?;
        let output = runner.capture(&plan).await?;
        progress.reach(test);
        Ok(output.relativize(guard.handle().root(), ENV_PLACEHOLDER))
    }
}

type Finished = (PackageRecord, OwnedSemaphorePermit);

/// Drives a catalog through the [`DifferentialRunner`].
pub struct DifferentialPipeline {
    runner: Arc<DifferentialRunner>,
}

impl DifferentialPipeline {
    pub fn new(runner: DifferentialRunner) -> Self {
        Self {
            runner: Arc::new(runner),
        }
    }

    /// Process `catalog` in order under `controller`, reporting as packages finish.
    ///
    /// Up to `workers` packages run at once. The controller is asked about a
    /// package only once a worker is free, and a permit is returned only after
    /// its package's outcome has been recorded and `should_abort` consulted, so
    /// with one worker no package is activated before the previous verdict.
    pub async fn run<C, W>(
        &self,
        catalog: &PackageCatalog,
        mut controller: C,
        reporter: &mut Reporter<W>,
    ) -> anyhow::Result<RunReport>
    where
        C: IterationController,
        W: Write,
    {
        let spec = self.runner.spec();
        let started = Instant::now();
        let mut report = RunReport::new();
        let run_id = report.run_id().to_string();
        let workers = spec.workers.max(1);
        emit_run_started(&run_id, catalog.len(), workers, spec.isolation.name());

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks: JoinSet<Finished> = JoinSet::new();

        let dispatch = async {
            'dispatch: for package in catalog.iter() {
                // settle finished work before the controller sees the next identifier
                let permit = loop {
                    if let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() {
                        break permit;
                    }
                    match tasks.join_next().await {
                        Some(joined) => {
                            if complete(joined, &mut controller, &mut report, reporter) {
                                break 'dispatch;
                            }
                        }
                        None => break Arc::clone(&semaphore).acquire_owned().await?,
                    }
                };

                if !controller.should_activate(&package.name) {
                    continue;
                }
                if controller.skip_notice(&package.name) {
                    let reason = package
                        .details
                        .skip_reason
                        .as_deref()
                        .unwrap_or("excluded by policy");
                    record_skip(&package.name, reason, reporter);
                    if controller.exhausted() {
                        break;
                    }
                    continue;
                }

                let runner = Arc::clone(&self.runner);
                let span = PackageSpan::span(&package.name);
                tasks.spawn(
                    async move {
                        let record = AssertUnwindSafe(runner.run_package(&package))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| {
                                PackageRecord::errored(&package.name, panic_failure(panic))
                            });
                        (record, permit)
                    }
                    .instrument(span),
                );
            }

            while let Some(joined) = tasks.join_next().await {
                complete(joined, &mut controller, &mut report, reporter);
            }
            Ok::<(), anyhow::Error>(())
        };

        let timed_out = match spec.run_timeout_secs {
            0 => {
                dispatch.await?;
                false
            }
            limit => match tokio::time::timeout(Duration::from_secs(limit), dispatch).await {
                Ok(result) => {
                    result?;
                    false
                }
                Err(_) => true,
            },
        };

        if timed_out {
            // cancelled tasks drop their environment guards
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                complete(joined, &mut controller, &mut report, reporter);
            }
        }

        let aborted = controller.state() == CursorState::Aborted;
        report.finish(aborted, timed_out);
        if timed_out {
            emit_run_aborted(&run_id, "run time limit reached");
        } else if aborted {
            emit_run_aborted(&run_id, "finding");
        }

        let finished = controller.finish();
        emit_run_finished(
            &run_id,
            started.elapsed().as_millis() as u64,
            report.matched(),
            report.mismatched(),
            report.errored(),
        );
        if let Err(e) = reporter.summary(&report) {
            warn!(error = %e, "Failed to write summary");
        }
        finished.context("failed to finalize iteration state")?;

        info!(run_id = %run_id, packages = report.len(), "Differential run complete");
        Ok(report)
    }
}

/// Record a finished task. Returns whether the controller stops the run.
fn complete<C: IterationController, W: Write>(
    joined: Result<Finished, JoinError>,
    controller: &mut C,
    report: &mut RunReport,
    reporter: &mut Reporter<W>,
) -> bool {
    let (record, _permit) = match joined {
        Ok(finished) => finished,
        Err(e) if e.is_cancelled() => {
            debug!("Package task cancelled");
            return false;
        }
        Err(e) => {
            warn!(error = %e, "Package task failed to complete");
            return false;
        }
    };
    if let Err(e) = reporter.package_finished(&record) {
        warn!(package = %record.package, error = %e, "Failed to write package status");
    }
    let stop = controller.should_abort(&record.package, record.outcome.is_finding());
    report.push(record);
    stop
}

fn record_skip<W: Write>(package: &str, reason: &str, reporter: &mut Reporter<W>) {
    let _span = PackageSpan::enter(package);
    emit_package_skipped(package, reason);
    if let Err(e) = reporter.package_skipped(package, reason) {
        warn!(error = %e, "Failed to write skip notice");
    }
}

fn panic_failure(payload: Box<dyn Any + Send>) -> PipelineFailure {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    PipelineError::Environment(format!("package task panicked: {message}"))
        .into_failure(Stage::Provision)
}
