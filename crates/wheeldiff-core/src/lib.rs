//! wheeldiff core library
//!
//! Domain model, iteration control, output comparison and reporting shared by
//! the pipeline and the CLI. Nothing here spawns processes; environments are
//! driven by the `wheeldiff-pipeline` crate.

pub mod compare;
pub mod domain;
pub mod obs;
pub mod reporter;
pub mod search;
pub mod telemetry;

pub use compare::{
    Channel, CompareError, CompareFlags, LineComparator, OutputComparator, DIFF_CONTEXT_LINES,
};

pub use domain::{
    CatalogError, DiffResult, ErrorKind, InstallMarkers, PackageCatalog, PackageDescriptor,
    PackageDetails, PackageOutcome, PackageRecord, PackageState, PipelineError, PipelineFailure,
    ProgressTracker, RunReport, Stage, Variant,
};

pub use reporter::{Reporter, Style, UnknownStyle};

pub use search::{
    resume_state_path, CursorState, IterationController, Pattern, SearchError, SearchMode,
    SearchPolicy,
};

pub use telemetry::init_tracing;
