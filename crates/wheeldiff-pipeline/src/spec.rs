//! Run specification and identity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use wheeldiff_core::{resume_state_path, PackageCatalog};

use crate::stage::Toolchain;

/// How baseline and optimized builds share environments.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Baseline and optimized each get a fresh environment.
    #[default]
    Split,
    /// The optimized build is installed over the baseline in one environment.
    Shared,
}

impl IsolationMode {
    pub fn name(&self) -> &'static str {
        match self {
            IsolationMode::Split => "split",
            IsolationMode::Shared => "shared",
        }
    }
}

/// Configuration of a differential run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSpec {
    /// Directory holding the per-package environments.
    pub work_dir: PathBuf,

    /// Directory holding resume markers.
    pub state_dir: PathBuf,

    pub toolchain: Toolchain,

    /// Limit for each command sequence (0 = unlimited).
    pub command_timeout_secs: u64,

    /// Limit for one package's whole pipeline (0 = unlimited).
    pub package_timeout_secs: u64,

    /// Limit for the whole run (0 = unlimited).
    pub run_timeout_secs: u64,

    /// Packages processed concurrently.
    pub workers: usize,

    pub isolation: IsolationMode,
}

impl Default for RunSpec {
    fn default() -> Self {
        let work_dir = std::env::temp_dir().join("wheeldiff");
        Self {
            state_dir: work_dir.join("state"),
            work_dir,
            toolchain: Toolchain::default(),
            command_timeout_secs: 1800,
            package_timeout_secs: 7200,
            run_timeout_secs: 0,
            workers: 1,
            isolation: IsolationMode::Split,
        }
    }
}

impl RunSpec {
    /// Resume marker location for `catalog`.
    pub fn resume_state_path(&self, catalog: &PackageCatalog) -> PathBuf {
        resume_state_path(&self.state_dir, &catalog.digest())
    }

    /// Root under which environments are created.
    pub fn env_base(&self) -> &Path {
        &self.work_dir
    }

    /// SHA-256 of the settings that influence outcomes (hex).
    ///
    /// Directories, worker count and the run timeout are not part of it.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        let fields: [&str; 4] = [
            &self.toolchain.tool,
            &self.toolchain.baseline_build,
            &self.toolchain.optimized_build,
            self.isolation.name(),
        ];
        for field in fields.iter().copied().chain(self.toolchain.pytest_args.iter().map(String::as_str)) {
            hasher.update(field.as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(self.command_timeout_secs.to_le_bytes());
        hasher.update(self.package_timeout_secs.to_le_bytes());
        hex::encode(hasher.finalize())
    }
}
