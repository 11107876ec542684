//! wheeldiff pipeline - differential build/test runs
//!
//! Provides the orchestration that:
//! - Builds each package twice (baseline and optimized) in fresh environments
//! - Runs the package's test suite against both installs
//! - Compares the captured outputs and records one outcome per package
//! - Evaluates the run report into an exit code

pub mod gate;
pub mod pipeline;
pub mod runner;
pub mod spec;
pub mod stage;

// Re-export key types
pub use gate::{GateVerdict, RunGate};
pub use pipeline::{DifferentialPipeline, DifferentialRunner, EnvGuard, ENV_PLACEHOLDER};
pub use runner::{StageResult, StageRunner};
pub use spec::{IsolationMode, RunSpec};
pub use stage::{StagePlan, Toolchain};
