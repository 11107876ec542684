//! Stage execution inside one environment.

use std::time::Instant;

use wheeldiff_core::obs::emit_package_stage;
use wheeldiff_core::{PipelineError, Stage};
use wheeldiff_env::{CapturedOutput, CommandSequence, EnvError, EnvHandle, EnvironmentManager};

use crate::stage::StagePlan;

/// Result of a stage that ran to completion.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage: Stage,

    /// Exit code (0 = success).
    pub exit_code: i32,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl StageResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs stage plans for one package in one environment.
pub struct StageRunner<'a> {
    env: &'a dyn EnvironmentManager,
    handle: &'a EnvHandle,
    package: &'a str,
}

impl<'a> StageRunner<'a> {
    pub fn new(env: &'a dyn EnvironmentManager, handle: &'a EnvHandle, package: &'a str) -> Self {
        Self {
            env,
            handle,
            package,
        }
    }

    /// Run a plan; a non-zero exit fails the stage.
    pub async fn execute(&self, plan: &StagePlan) -> Result<StageResult, PipelineError> {
        let start = Instant::now();
        let status = self
            .env
            .run(self.handle, &plan.commands)
            .await
            .map_err(|e| stage_error(plan.stage, e))?;

        if !status.passed() {
            let mut reason = format!("{} exited with code {}", status.label, status.exit_code);
            if !status.stderr_tail.is_empty() {
                reason.push_str(":\n");
                reason.push_str(&status.stderr_tail);
            }
            return Err(PipelineError::for_stage(plan.stage, reason));
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        emit_package_stage(self.package, plan.stage, duration_ms);
        Ok(StageResult {
            stage: plan.stage,
            exit_code: status.exit_code,
            duration_ms,
        })
    }

    /// Run a plan and capture its output; the exit code is part of the output, not a failure.
    pub async fn capture(&self, plan: &StagePlan) -> Result<CapturedOutput, PipelineError> {
        let start = Instant::now();
        let output = self
            .env
            .run_capturing(self.handle, &plan.commands)
            .await
            .map_err(|e| stage_error(plan.stage, e))?;
        emit_package_stage(self.package, plan.stage, start.elapsed().as_millis() as u64);
        Ok(output)
    }

    /// Run the install marker probe; any failure yields no marker.
    pub async fn probe(&self, commands: &CommandSequence) -> Option<String> {
        match self.env.run_capturing(self.handle, commands).await {
            Ok(output) => {
                let marker = output.stdout.trim();
                (!marker.is_empty()).then(|| marker.to_string())
            }
            Err(e) => {
                tracing::debug!(package = %self.package, error = %e, "Install probe failed");
                None
            }
        }
    }
}

/// Map an environment failure during `stage` to the pipeline taxonomy.
pub fn stage_error(stage: Stage, err: EnvError) -> PipelineError {
    match err {
        EnvError::Timeout { label, limit_secs } => PipelineError::Timeout { label, limit_secs },
        other => PipelineError::for_stage(stage, other.to_string()),
    }
}
