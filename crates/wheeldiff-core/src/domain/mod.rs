//! Domain models for wheeldiff.
//!
//! Canonical definitions for the core entities:
//! - `PackageDescriptor` / `PackageCatalog`: what gets verified, in which order
//! - `Stage` / `PackageState`: where a package is in the differential sequence
//! - `PackageOutcome` / `PackageRecord` / `RunReport`: what came out of it

pub mod error;
pub mod outcome;
pub mod package;
pub mod stage;

// Re-export main types and errors
pub use error::{CatalogError, ErrorKind, PipelineError, PipelineFailure};
pub use outcome::{DiffResult, InstallMarkers, PackageOutcome, PackageRecord, RunReport};
pub use package::{PackageCatalog, PackageDescriptor, PackageDetails};
pub use stage::{PackageState, ProgressTracker, Stage, Variant};
