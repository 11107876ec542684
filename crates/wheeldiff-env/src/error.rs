//! Error types for wheeldiff-env

use thiserror::Error;

/// Errors that can occur while provisioning or driving an environment
#[derive(Error, Debug)]
pub enum EnvError {
    /// The environment could not be created
    #[error("Failed to provision environment {name}: {reason}")]
    Provision { name: String, reason: String },

    /// A command sequence could not be started at all
    #[error("Failed to spawn `{label}`: {reason}")]
    Spawn { label: String, reason: String },

    /// A command sequence exceeded its time limit (child was killed)
    #[error("`{label}` timed out after {limit_secs} seconds")]
    Timeout { label: String, limit_secs: u64 },

    /// The sequence was empty
    #[error("Command sequence `{0}` is empty")]
    EmptySequence(String),

    /// The environment handle does not refer to a live environment
    #[error("Unknown environment: {0}")]
    UnknownEnvironment(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvError {
    /// Whether this error is a time-limit violation.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EnvError::Timeout { .. })
    }
}
