//! wheeldiff - differential build/test verification CLI
//!
//! The `wheeldiff` command builds every package of a catalog twice, once
//! plainly and once through the optimizing tool, runs the package's tests
//! against both installs and reports any divergence.
//!
//! ## Commands
//!
//! - `run`: process a catalog under a search mode
//! - `list`: show the catalog
//! - `compare`: compare two captured outputs offline

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, Level};

use wheeldiff_core::{
    init_tracing, Channel, CompareFlags, DiffResult, LineComparator, OutputComparator, PackageCatalog,
    Pattern, Reporter, SearchMode,
};
use wheeldiff_env::VirtualenvManager;
use wheeldiff_pipeline::{
    DifferentialPipeline, DifferentialRunner, IsolationMode, RunGate, RunSpec, Toolchain,
};

#[derive(Parser)]
#[command(name = "wheeldiff")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Differential build/test verification for Python packages", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, test and compare every selected package
    Run(RunArgs),

    /// List the packages of a catalog
    List {
        /// JSON catalog file (default: built-in catalog)
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// Compare two captured outputs the way a run does
    Compare {
        /// Baseline output file
        baseline: PathBuf,

        /// Optimized output file
        optimized: PathBuf,

        /// Channel label (stdout or stderr)
        #[arg(long, default_value = "stdout")]
        channel: Channel,

        /// Keep warning lines
        #[arg(long)]
        keep_warnings: bool,

        /// Keep info lines
        #[arg(long)]
        keep_infos: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Run everything in order
    Immediate,
    /// Run everything; findings never stop the run
    All,
    /// Start at the first package matching --start-at
    Search,
    /// Run only the first package matching --start-at (or the first package)
    Only,
    /// Continue from the package an earlier run stopped at
    Resume,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Isolation {
    Split,
    Shared,
}

impl From<Isolation> for IsolationMode {
    fn from(value: Isolation) -> Self {
        match value {
            Isolation::Split => IsolationMode::Split,
            Isolation::Shared => IsolationMode::Shared,
        }
    }
}

#[derive(clap::Args)]
struct RunArgs {
    /// Search mode
    #[arg(long, value_enum, default_value = "immediate")]
    mode: Mode,

    /// Glob selecting the package for `search` and `only`
    #[arg(long)]
    start_at: Option<String>,

    /// Findings in packages matching this glob never stop the run
    #[arg(long)]
    may_fail: Vec<String>,

    /// Stop after the first mismatch or error (immediate mode)
    #[arg(long)]
    abort_on_finding: bool,

    /// JSON catalog file (default: built-in catalog)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Packages processed concurrently
    #[arg(long, env = "WHEELDIFF_WORKERS", default_value = "1")]
    workers: usize,

    /// Environment isolation between the two builds
    #[arg(long, value_enum, default_value = "split")]
    isolation: Isolation,

    /// Limit per command sequence in seconds (0 = none)
    #[arg(long, default_value = "1800")]
    command_timeout_secs: u64,

    /// Limit per package in seconds (0 = none)
    #[arg(long, default_value = "7200")]
    package_timeout_secs: u64,

    /// Limit for the whole run in seconds (0 = none)
    #[arg(long, default_value = "0")]
    run_timeout_secs: u64,

    /// Directory for the per-package environments
    #[arg(long, env = "WHEELDIFF_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Directory for resume markers (default: <work-dir>/state)
    #[arg(long, env = "WHEELDIFF_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Interpreter used to create environments
    #[arg(long, env = "WHEELDIFF_PYTHON", default_value = "python3")]
    python: String,

    /// Optimizing tool installed into every environment (name or path)
    #[arg(long, env = "WHEELDIFF_TOOL")]
    tool: Option<String>,

    /// Write the run report as JSON
    #[arg(long)]
    report: Option<PathBuf>,

    /// Disable colored console output
    #[arg(long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::List { catalog } => cmd_list(catalog.as_deref()),
        Commands::Compare {
            baseline,
            optimized,
            channel,
            keep_warnings,
            keep_infos,
        } => cmd_compare(&baseline, &optimized, channel, keep_warnings, keep_infos),
    }
}

fn load_catalog(path: Option<&Path>) -> Result<PackageCatalog> {
    match path {
        Some(path) => PackageCatalog::load(path)
            .with_context(|| format!("Failed to load catalog {}", path.display())),
        None => Ok(PackageCatalog::builtin()),
    }
}

fn run_spec(args: &RunArgs) -> RunSpec {
    let defaults = RunSpec::default();
    let work_dir = args.work_dir.clone().unwrap_or(defaults.work_dir);
    let toolchain = match &args.tool {
        Some(tool) => Toolchain::default().with_tool(tool),
        None => Toolchain::default(),
    };
    RunSpec {
        state_dir: args
            .state_dir
            .clone()
            .unwrap_or_else(|| work_dir.join("state")),
        work_dir,
        toolchain,
        command_timeout_secs: args.command_timeout_secs,
        package_timeout_secs: args.package_timeout_secs,
        run_timeout_secs: args.run_timeout_secs,
        workers: args.workers.max(1),
        isolation: args.isolation.into(),
    }
}

fn search_mode(args: &RunArgs, spec: &RunSpec, catalog: &PackageCatalog) -> Result<SearchMode> {
    let pattern = args.start_at.as_deref();
    let mode = match args.mode {
        Mode::Immediate => SearchMode::immediate().with_abort_on_finding(args.abort_on_finding),
        Mode::All => SearchMode::all(),
        Mode::Search => {
            let pattern = pattern.context("--mode search requires --start-at")?;
            SearchMode::start_at(pattern)?
        }
        Mode::Only => match pattern {
            Some(pattern) => SearchMode::only(pattern)?,
            None => SearchMode::only_first(),
        },
        Mode::Resume => SearchMode::resume_with_state(spec.resume_state_path(catalog))
            .context("Failed to read resume state")?,
    };

    let mut mode = mode.with_skips(catalog.skip_policy());
    for glob in &args.may_fail {
        mode = mode.with_may_fail(Pattern::new(glob)?);
    }
    Ok(mode)
}

/// Run the differential pipeline over the catalog
async fn cmd_run(args: RunArgs) -> Result<ExitCode> {
    let catalog = load_catalog(args.catalog.as_deref())?;
    let spec = run_spec(&args);
    let mode = search_mode(&args, &spec, &catalog)?;

    std::fs::create_dir_all(spec.env_base())
        .with_context(|| format!("Failed to create {}", spec.env_base().display()))?;
    info!(
        packages = catalog.len(),
        mode = mode.policy().name(),
        spec_digest = %spec.digest(),
        "Starting differential run"
    );

    let env = Arc::new(VirtualenvManager::new(spec.env_base()).with_python(args.python.as_str()));
    let comparator = Arc::new(LineComparator::new()?);
    let pipeline = DifferentialPipeline::new(DifferentialRunner::new(env, comparator, spec));

    let mut reporter = Reporter::new(std::io::stdout().lock(), !args.no_color);
    let report = pipeline.run(&catalog, mode, &mut reporter).await?;

    if let Some(path) = &args.report {
        report
            .write_json(path)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!(path = %path.display(), "Run report written");
    }

    let verdict = RunGate::evaluate(&report);
    info!(passed = verdict.passed, "{}", verdict.message);
    for violation in &verdict.violations {
        info!("  - {}", violation);
    }
    Ok(ExitCode::from(verdict.exit_code()))
}

/// Print the catalog in processing order
fn cmd_list(catalog: Option<&Path>) -> Result<ExitCode> {
    let catalog = load_catalog(catalog)?;
    for package in catalog.iter() {
        println!("{}  {}", package.name, package.details.source);
        if let Some(requirements) = &package.details.requirements {
            println!("    requirements: {requirements}");
        }
        for excluded in &package.details.excluded_tests {
            println!("    excluded test: {excluded}");
        }
        if let Some(reason) = &package.details.skip_reason {
            println!("    skipped: {reason}");
        }
    }
    println!("\nTotal: {} package(s)", catalog.len());
    Ok(ExitCode::SUCCESS)
}

/// Compare two output files offline
fn cmd_compare(
    baseline: &Path,
    optimized: &Path,
    channel: Channel,
    keep_warnings: bool,
    keep_infos: bool,
) -> Result<ExitCode> {
    let diff = compare_files(baseline, optimized, channel, keep_warnings, keep_infos)?;
    if diff.is_empty() {
        println!("No differences on {channel}.");
        Ok(ExitCode::SUCCESS)
    } else {
        print!("{diff}");
        Ok(ExitCode::from(1))
    }
}

fn compare_files(
    baseline: &Path,
    optimized: &Path,
    channel: Channel,
    keep_warnings: bool,
    keep_infos: bool,
) -> Result<DiffResult> {
    let read = |path: &Path| {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
    };
    let flags = CompareFlags {
        ignore_warnings: !keep_warnings,
        ignore_infos: !keep_infos,
        ..CompareFlags::default()
    };
    Ok(LineComparator::new()?.compare(channel, &read(baseline)?, &read(optimized)?, flags)?)
}
