//! Integration tests for the differential pipeline with ScriptedEnvironment.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use wheeldiff_core::{
    Channel, CompareError, CompareFlags, CursorState, DiffResult, ErrorKind, IterationController,
    LineComparator, OutputComparator, PackageCatalog, PackageDescriptor, PackageOutcome, Pattern,
    Reporter, RunReport, SearchError, SearchMode, Stage,
};
use wheeldiff_env::fakes::{FakeCall, ScriptedEnvironment};
use wheeldiff_env::{CapturedOutput, CommandSequence, CommandStatus, EnvHandle, EnvResult, EnvironmentManager};
use wheeldiff_pipeline::{DifferentialPipeline, DifferentialRunner, RunGate, RunSpec};

fn catalog(names: &[&str]) -> PackageCatalog {
    PackageCatalog::from_descriptors(
        names
            .iter()
            .map(|name| PackageDescriptor::new(*name, format!("https://example.invalid/{name}.git"))),
    )
}

fn pipeline(env: Arc<dyn EnvironmentManager>, spec: RunSpec) -> DifferentialPipeline {
    let comparator = Arc::new(LineComparator::new().expect("comparator"));
    DifferentialPipeline::new(DifferentialRunner::new(env, comparator, spec))
}

/// Controller wrapper logging every call it receives.
struct Recording<C> {
    inner: C,
    calls: Arc<Mutex<Vec<String>>>,
}

impl<C: IterationController> Recording<C> {
    fn new(inner: C) -> (Self, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                inner,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl<C: IterationController> IterationController for Recording<C> {
    fn should_activate(&mut self, id: &str) -> bool {
        self.log(format!("activate {id}"));
        self.inner.should_activate(id)
    }

    fn skip_notice(&mut self, id: &str) -> bool {
        let skip = self.inner.skip_notice(id);
        if skip {
            self.log(format!("skip {id}"));
        }
        skip
    }

    fn has_activated_any(&self) -> bool {
        self.inner.has_activated_any()
    }

    fn should_abort(&mut self, id: &str, finding: bool) -> bool {
        self.log(format!("abort? {id}"));
        self.inner.should_abort(id, finding)
    }

    fn finish(&mut self) -> Result<(), SearchError> {
        self.log("finish".to_string());
        self.inner.finish()
    }

    fn stops_after_first(&self) -> bool {
        self.inner.stops_after_first()
    }

    fn exhausted(&self) -> bool {
        self.inner.exhausted()
    }

    fn state(&self) -> CursorState {
        self.inner.state()
    }
}

/// Comparator that fails on every call.
struct Faulting;

impl OutputComparator for Faulting {
    fn compare(
        &self,
        _channel: Channel,
        _baseline: &str,
        _optimized: &str,
        _flags: CompareFlags,
    ) -> Result<DiffResult, CompareError> {
        Err(CompareError::Faulted("comparator crashed".into()))
    }
}

/// Run `catalog` and return the report plus everything printed to the console.
async fn run(
    env: Arc<dyn EnvironmentManager>,
    spec: RunSpec,
    catalog: &PackageCatalog,
    mode: SearchMode,
) -> (RunReport, String) {
    let mut reporter = Reporter::new(Vec::new(), false);
    let report = pipeline(env, spec)
        .run(catalog, mode, &mut reporter)
        .await
        .expect("run failed");
    let console = String::from_utf8(reporter.into_inner()).expect("utf8 console");
    (report, console)
}

fn names(report: &RunReport) -> Vec<String> {
    report.entries().iter().map(|e| e.package.clone()).collect()
}

/// Environment that stalls one package's baseline build for an hour.
struct Stalling {
    inner: ScriptedEnvironment,
    package: &'static str,
}

#[async_trait]
impl EnvironmentManager for Stalling {
    async fn create(&self, name: &str) -> EnvResult<EnvHandle> {
        self.inner.create(name).await
    }

    async fn run(&self, handle: &EnvHandle, commands: &CommandSequence) -> EnvResult<CommandStatus> {
        if handle.name().starts_with(self.package) && commands.label == "baseline_build" {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.inner.run(handle, commands).await
    }

    async fn run_capturing(
        &self,
        handle: &EnvHandle,
        commands: &CommandSequence,
    ) -> EnvResult<CapturedOutput> {
        self.inner.run_capturing(handle, commands).await
    }

    fn destroy(&self, handle: &EnvHandle) {
        self.inner.destroy(handle)
    }
}

/// Test: a syntax error in the optimized build is a mismatch and fails the gate
#[tokio::test]
async fn test_syntax_error_in_optimized_build() {
    let env = Arc::new(ScriptedEnvironment::new());
    env.respond(
        "pkgB",
        "optimized_test",
        CapturedOutput::new("", "  File \"pkgB/core.py\", line 3\nSyntaxError: invalid syntax\n"),
    );

    let (report, console) = run(
        env.clone(),
        RunSpec::default(),
        &catalog(&["pkgA", "pkgB"]),
        SearchMode::immediate(),
    )
    .await;

    let triples = report.triples();
    assert_eq!(triples.len(), 2);
    assert_eq!(triples[0], ("pkgA".to_string(), String::new(), String::new()));
    assert_eq!(triples[1].0, "pkgB");
    assert!(triples[1].1.is_empty(), "stdout should match");
    assert!(
        triples[1].2.starts_with("SyntaxError only in optimized output"),
        "unexpected stderr diff: {}",
        triples[1].2
    );
    assert_eq!(report.entries()[1].outcome, PackageOutcome::Mismatch);

    let verdict = RunGate::evaluate(&report);
    assert!(!verdict.passed);
    assert_eq!(verdict.exit_code(), 1);

    assert!(console.contains("--- pkgA --- exit_stdout: 0 exit_stderr: 0"));
    assert!(console.contains("--- pkgB --- exit_stdout: 0 exit_stderr: 1"));
    assert!(console.contains("SUMMARY"));
    assert!(console.contains("pkgA - stdout: clean stderr: clean"));
    assert!(console.contains("pkgB - stdout: clean stderr: differs"));
    assert_eq!(env.live_count(), 0);
}

/// Test: identical outputs on both channels match
#[tokio::test]
async fn test_identical_outputs_match() {
    let env = Arc::new(ScriptedEnvironment::new());
    for label in ["baseline_test", "optimized_test"] {
        env.respond("idna", label, CapturedOutput::new("12 passed in 0.3s\n", "warning: slow\n"));
    }

    let (report, _) = run(env, RunSpec::default(), &catalog(&["idna"]), SearchMode::immediate()).await;

    let entry = &report.entries()[0];
    assert_eq!(entry.outcome, PackageOutcome::Match);
    assert!(entry.stdout_diff.is_empty());
    assert!(entry.stderr_diff.is_empty());
    assert!(RunGate::evaluate(&report).passed);
}

/// Test: fetch failure is an error, torn down once, and the run continues
#[tokio::test]
async fn test_fetch_failure_continues_run() {
    let env = Arc::new(ScriptedEnvironment::new());
    env.fail_stage("pkgA", "fetch", 128);

    let (report, console) = run(
        env.clone(),
        RunSpec::default(),
        &catalog(&["pkgA", "pkgB"]),
        SearchMode::immediate(),
    )
    .await;

    assert_eq!(names(&report), vec!["pkgA", "pkgB"]);
    let failure = report.entries()[0].outcome.failure().expect("pkgA errored");
    assert_eq!(failure.kind, ErrorKind::Fetch);
    assert_eq!(env.destroyed("pkgA-baseline"), 1);
    assert_eq!(env.created("pkgA-optimized"), 0);
    assert_eq!(report.entries()[1].outcome, PackageOutcome::Match);
    assert_eq!(report.errored(), 1);
    assert!(console.contains("pkgA - "));
}

/// Test: an optimized build failure tears down before the next package starts
#[tokio::test]
async fn test_build_failure_teardown_precedes_next_package() {
    let env = Arc::new(ScriptedEnvironment::new());
    env.fail_stage("pkgA", "optimized_build", 1);

    let (report, _) = run(
        env.clone(),
        RunSpec::default(),
        &catalog(&["pkgA", "pkgB"]),
        SearchMode::immediate(),
    )
    .await;

    let failure = report.entries()[0].outcome.failure().expect("pkgA errored");
    assert_eq!(failure.kind, ErrorKind::Build);

    let calls = env.calls();
    let teardown = calls
        .iter()
        .position(|c| *c == FakeCall::Destroy("pkgA-optimized".to_string()))
        .expect("pkgA-optimized torn down");
    let next = calls
        .iter()
        .position(|c| *c == FakeCall::Create("pkgB-baseline".to_string()))
        .expect("pkgB-baseline created");
    assert!(teardown < next);
    assert_eq!(env.live_count(), 0);
}

/// Test: resuming at C activates exactly C then D and clears the marker
#[tokio::test]
async fn test_resume_at_marker() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("resume.json");
    std::fs::write(&state, r#"{"package":"C","updated_at":"2026-01-01T00:00:00Z"}"#).unwrap();

    let env = Arc::new(ScriptedEnvironment::new());
    let mode = SearchMode::resume_with_state(&state).unwrap();
    let (report, _) = run(
        env.clone(),
        RunSpec::default(),
        &catalog(&["A", "B", "C", "D"]),
        mode,
    )
    .await;

    assert_eq!(names(&report), vec!["C", "D"]);
    assert_eq!(env.created("A-baseline"), 0);
    assert_eq!(env.created("B-baseline"), 0);
    assert!(!state.exists(), "marker should be cleared after a complete run");
}

/// Test: an aborting finding leaves the marker at the aborting package
#[tokio::test]
async fn test_resume_marker_survives_abort() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("resume.json");

    let env = Arc::new(ScriptedEnvironment::new());
    env.respond("B", "optimized_test", CapturedOutput::new("1 failed\n", ""));
    let mode = SearchMode::resume_with_state(&state).unwrap();
    let (report, _) = run(env, RunSpec::default(), &catalog(&["A", "B", "C"]), mode).await;

    assert_eq!(names(&report), vec!["A", "B"]);
    assert!(report.aborted());
    let stored = std::fs::read_to_string(&state).unwrap();
    assert!(stored.contains(r#""package":"B""#));
}

/// Test: stop after the first activated package
#[tokio::test]
async fn test_only_first_package() {
    let env = Arc::new(ScriptedEnvironment::new());
    let (report, console) = run(
        env.clone(),
        RunSpec::default(),
        &catalog(&["A", "B", "C", "D"]),
        SearchMode::only_first(),
    )
    .await;

    assert_eq!(names(&report), vec!["A"]);
    assert_eq!(env.created("B-baseline"), 0);
    assert!(console.contains("1 packages: 1 matched, 0 mismatched, 0 errored"));
}

/// Test: packages excluded by policy are announced and never run
#[tokio::test]
async fn test_skip_policy() {
    let env = Arc::new(ScriptedEnvironment::new());
    let catalog = PackageCatalog::from_descriptors([
        PackageDescriptor::new("A", "src"),
        PackageDescriptor::new("B", "src").skipped("optimized build unsupported"),
        PackageDescriptor::new("C", "src"),
    ]);
    let mode = SearchMode::immediate().with_skips(catalog.skip_policy());

    let (report, console) = run(env.clone(), RunSpec::default(), &catalog, mode).await;

    assert_eq!(names(&report), vec!["A", "C"]);
    assert_eq!(env.created("B-baseline"), 0);
    assert!(console.contains("Skipping B: optimized build unsupported"));
}

/// Test: abort-on-finding stops after the first mismatch, summary still printed
#[tokio::test]
async fn test_abort_on_finding() {
    let env = Arc::new(ScriptedEnvironment::new());
    env.respond("B", "optimized_test", CapturedOutput::new("1 failed\n", ""));
    let mode = SearchMode::immediate().with_abort_on_finding(true);

    let (report, console) = run(env.clone(), RunSpec::default(), &catalog(&["A", "B", "C"]), mode).await;

    assert_eq!(names(&report), vec!["A", "B"]);
    assert!(report.aborted());
    assert_eq!(env.created("C-baseline"), 0);
    assert!(console.contains("B - stdout: differs stderr: clean"));
    assert!(console.contains("Run stopped early after a finding."));
}

/// Test: may-fail packages do not stop an aborting run
#[tokio::test]
async fn test_may_fail_does_not_abort() {
    let env = Arc::new(ScriptedEnvironment::new());
    env.respond("B", "optimized_test", CapturedOutput::new("1 failed\n", ""));
    let mode = SearchMode::immediate()
        .with_abort_on_finding(true)
        .with_may_fail(Pattern::new("B").unwrap());

    let (report, _) = run(env, RunSpec::default(), &catalog(&["A", "B", "C"]), mode).await;

    assert_eq!(names(&report), vec!["A", "B", "C"]);
    assert!(!report.aborted());
    assert_eq!(report.mismatched(), 1);
}

/// Test: the run time limit cancels in-flight work and still tears it down
#[tokio::test(start_paused = true)]
async fn test_run_timeout_tears_down_in_flight() {
    let env = Arc::new(Stalling {
        inner: ScriptedEnvironment::new(),
        package: "B",
    });
    let spec = RunSpec {
        run_timeout_secs: 60,
        package_timeout_secs: 0,
        ..RunSpec::default()
    };

    let (report, console) = run(env.clone(), spec, &catalog(&["A", "B", "C"]), SearchMode::immediate()).await;

    assert_eq!(names(&report), vec!["A"]);
    assert!(report.timed_out());
    assert_eq!(env.inner.created("B-baseline"), 1);
    assert_eq!(env.inner.destroyed("B-baseline"), 1);
    assert_eq!(env.inner.created("C-baseline"), 0);
    assert_eq!(env.inner.live_count(), 0);
    assert!(console.contains("Run stopped: time limit reached."));
    assert_eq!(RunGate::evaluate(&report).exit_code(), 1);
}

/// Test: several workers process every package and leave nothing live
#[tokio::test]
async fn test_parallel_workers() {
    let env = Arc::new(ScriptedEnvironment::new());
    env.respond("p3", "optimized_test", CapturedOutput::new("", "Traceback\n"));
    let spec = RunSpec {
        workers: 3,
        ..RunSpec::default()
    };

    let (report, _) = run(
        env.clone(),
        spec,
        &catalog(&["p1", "p2", "p3", "p4", "p5"]),
        SearchMode::all(),
    )
    .await;

    let mut seen = names(&report);
    seen.sort();
    assert_eq!(seen, vec!["p1", "p2", "p3", "p4", "p5"]);
    assert_eq!(report.mismatched(), 1);
    assert_eq!(report.matched(), 4);
    assert_eq!(env.live_count(), 0);
}

/// Test: the JSON report round-trips through disk
#[tokio::test]
async fn test_report_written_as_json() {
    let env = Arc::new(ScriptedEnvironment::new());
    let (report, _) = run(env, RunSpec::default(), &catalog(&["A"]), SearchMode::immediate()).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    report.write_json(&path).unwrap();

    let loaded: RunReport = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(loaded, report);
}

/// Test: with one worker, a verdict is settled before the next package is considered
#[tokio::test]
async fn test_abort_decided_before_next_activation() {
    let env = Arc::new(ScriptedEnvironment::new());
    env.respond("A", "optimized_test", CapturedOutput::new("1 failed\n", ""));
    let catalog = PackageCatalog::from_descriptors([
        PackageDescriptor::new("A", "src"),
        PackageDescriptor::new("B", "src").skipped("optimized build unsupported"),
        PackageDescriptor::new("C", "src"),
    ]);
    let mode = SearchMode::immediate()
        .with_skips(catalog.skip_policy())
        .with_abort_on_finding(true);
    let (controller, calls) = Recording::new(mode);

    let mut reporter = Reporter::new(Vec::new(), false);
    let report = pipeline(env.clone(), RunSpec::default())
        .run(&catalog, controller, &mut reporter)
        .await
        .expect("run failed");
    let console = String::from_utf8(reporter.into_inner()).unwrap();

    assert_eq!(*calls.lock().unwrap(), vec!["activate A", "abort? A", "finish"]);
    assert!(!console.contains("Skipping B"));
    assert_eq!(names(&report), vec!["A"]);
    assert!(report.aborted());
}

/// Test: an empty catalog still finishes the controller exactly once
#[tokio::test]
async fn test_empty_catalog_finishes_once() {
    let env = Arc::new(ScriptedEnvironment::new());
    let (controller, calls) = Recording::new(SearchMode::immediate());

    let mut reporter = Reporter::new(Vec::new(), false);
    let report = pipeline(env.clone(), RunSpec::default())
        .run(&catalog(&[]), controller, &mut reporter)
        .await
        .expect("run failed");

    assert!(report.is_empty());
    assert_eq!(*calls.lock().unwrap(), vec!["finish"]);
    assert!(env.calls().is_empty());
}

/// Test: a resume marker naming no catalog entry activates nothing and still succeeds
#[tokio::test]
async fn test_resume_marker_not_in_catalog() {
    let env = Arc::new(ScriptedEnvironment::new());
    let (controller, calls) = Recording::new(SearchMode::resume_from(Some("Z".into())));

    let mut reporter = Reporter::new(Vec::new(), false);
    let report = pipeline(env.clone(), RunSpec::default())
        .run(&catalog(&["A", "B"]), controller, &mut reporter)
        .await
        .expect("run failed");

    assert!(report.is_empty());
    assert!(env.calls().is_empty());
    let calls = calls.lock().unwrap();
    assert_eq!(calls.iter().filter(|c| *c == "finish").count(), 1);
    assert_eq!(calls.last().map(String::as_str), Some("finish"));
}

/// Test: a faulting comparator is a comparison error and the run continues
#[tokio::test]
async fn test_comparator_fault_is_reported_per_package() {
    let env = Arc::new(ScriptedEnvironment::new());
    let pipeline = DifferentialPipeline::new(DifferentialRunner::new(
        env.clone(),
        Arc::new(Faulting),
        RunSpec::default(),
    ));

    let mut reporter = Reporter::new(Vec::new(), false);
    let report = pipeline
        .run(&catalog(&["A", "B"]), SearchMode::immediate(), &mut reporter)
        .await
        .expect("run failed");

    assert_eq!(names(&report), vec!["A", "B"]);
    for entry in report.entries() {
        let failure = entry.outcome.failure().expect("comparison failure");
        assert_eq!(failure.kind, ErrorKind::Comparison);
        assert_eq!(failure.stage, Stage::Compare);
        assert!(failure.message.contains("comparator crashed"));
    }
    assert_eq!(env.live_count(), 0);
}

/// Test: teardown on a multi-threaded runtime leaves no environment behind
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_teardown_on_multi_thread_runtime() {
    let env = Arc::new(ScriptedEnvironment::new());
    env.fail_stage("B", "baseline_build", 1);
    let spec = RunSpec {
        workers: 2,
        ..RunSpec::default()
    };

    let (report, _) = run(env.clone(), spec, &catalog(&["A", "B", "C"]), SearchMode::all()).await;

    assert_eq!(report.len(), 3);
    assert_eq!(report.errored(), 1);
    assert_eq!(env.live_count(), 0);
}
