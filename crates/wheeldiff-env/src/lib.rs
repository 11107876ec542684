//! wheeldiff-env: isolated execution environments for differential runs
//!
//! An environment is a disposable directory with its own Python interpreter
//! prefix. Commands never rely on the process working directory: every
//! [`CommandSequence`] names its work directory relative to the environment
//! root, so several environments can be driven concurrently.
//!
//! - [`EnvironmentManager`]: the contract consumed by the pipeline
//! - [`VirtualenvManager`]: default adapter backed by `python -m venv`
//! - [`fakes::ScriptedEnvironment`]: in-memory manager for tests

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod error;
pub mod fakes;
pub mod venv;

pub use error::EnvError;
pub use venv::VirtualenvManager;

/// Result type for environment operations
pub type EnvResult<T> = std::result::Result<T, EnvError>;

/// Number of trailing stderr lines kept in a [`CommandStatus`].
pub const STDERR_TAIL_LINES: usize = 20;

/// Handle to a live environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvHandle {
    name: String,
    root: PathBuf,
}

impl EnvHandle {
    /// Create a handle for an environment rooted at `root`.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    /// Environment name (as passed to `create`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root directory of the environment.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path relative to the environment root.
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }
}

impl std::fmt::Display for EnvHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// An ordered list of shell commands executed as one unit.
///
/// Commands are chained with `&&`: the first failing command stops the
/// sequence and its exit code becomes the sequence's exit code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSequence {
    /// Short label used in logs and error messages (e.g. `baseline_build`).
    pub label: String,

    /// Work directory, relative to the environment root.
    pub workdir: PathBuf,

    /// Shell commands, in order.
    pub commands: Vec<String>,

    /// Time limit in seconds (0 = unlimited).
    pub timeout_secs: u64,
}

impl CommandSequence {
    /// Start an empty sequence running in the environment root.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            workdir: PathBuf::new(),
            commands: Vec::new(),
            timeout_secs: 0,
        }
    }

    /// Run the sequence in `dir` (relative to the environment root).
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = dir.into();
        self
    }

    /// Append a command.
    pub fn then(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    /// Set the time limit.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// The `&&`-joined script handed to the shell.
    pub fn script(&self) -> String {
        self.commands.join(" && ")
    }
}

/// Exit status of a command sequence run without output capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    /// Sequence label.
    pub label: String,

    /// Exit code (-1 when terminated by a signal).
    pub exit_code: i32,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,

    /// Last lines of stderr, kept for diagnostics.
    pub stderr_tail: String,
}

impl CommandStatus {
    /// Whether the sequence exited with code 0.
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Output captured from a command sequence: (stdout, stderr).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Replace every occurrence of `root` with `placeholder` on both channels.
    pub fn relativize(&self, root: &Path, placeholder: &str) -> Self {
        let root = root.to_string_lossy();
        if root.is_empty() {
            return self.clone();
        }
        Self {
            stdout: self.stdout.replace(root.as_ref(), placeholder),
            stderr: self.stderr.replace(root.as_ref(), placeholder),
        }
    }
}

/// Creates, drives and destroys isolated environments.
///
/// Guarantees expected by the pipeline:
/// - `create` returns a fresh environment; names are never shared between live environments.
/// - `run` reports a non-zero exit code as `Ok`; only inability to run is an `Err`.
/// - `run_capturing` returns output regardless of the exit code.
/// - `destroy` is idempotent and never fails past this boundary.
#[async_trait]
pub trait EnvironmentManager: Send + Sync {
    /// Provision a new environment.
    async fn create(&self, name: &str) -> EnvResult<EnvHandle>;

    /// Run a sequence and report its exit status.
    async fn run(&self, handle: &EnvHandle, commands: &CommandSequence) -> EnvResult<CommandStatus>;

    /// Run a sequence and capture (stdout, stderr).
    async fn run_capturing(
        &self,
        handle: &EnvHandle,
        commands: &CommandSequence,
    ) -> EnvResult<CapturedOutput>;

    /// Tear the environment down (best-effort, synchronous so it can run from `Drop`).
    fn destroy(&self, handle: &EnvHandle);
}

/// Quote a string for inclusion in a POSIX shell command.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@+%,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Keep the last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
