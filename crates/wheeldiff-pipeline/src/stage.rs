//! Command plans for each pipeline stage.

use serde::{Deserialize, Serialize};
use wheeldiff_core::{PackageDescriptor, Stage, Variant};
use wheeldiff_env::{shell_quote, CommandSequence};

/// Tools and arguments used to build, install and test a package.
///
/// Commands run inside the environment, so `python` is the environment's
/// interpreter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Toolchain {
    /// pip requirement (or local path) installing the transformation tool.
    pub tool: String,

    /// `setup.py` command producing the baseline wheel.
    pub baseline_build: String,

    /// `setup.py` command producing the optimized wheel.
    pub optimized_build: String,

    /// Extra pytest arguments.
    pub pytest_args: Vec<String>,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            tool: "nuitka".to_string(),
            baseline_build: "bdist_wheel".to_string(),
            optimized_build: "bdist_nuitka".to_string(),
            pytest_args: vec!["--disable-warnings".to_string()],
        }
    }
}

impl Toolchain {
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = tool.into();
        self
    }

    fn build_command(&self, variant: Variant) -> &str {
        match variant {
            Variant::Baseline => &self.baseline_build,
            Variant::Optimized => &self.optimized_build,
        }
    }
}

/// The command sequence a stage runs for one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub stage: Stage,
    pub commands: CommandSequence,
}

impl StagePlan {
    /// Plan `stage` for `package`.
    ///
    /// Returns `None` for stages that run no commands (`Provision`,
    /// `Compare`, and `PruneTests` when nothing is excluded).
    pub fn for_stage(
        stage: Stage,
        package: &PackageDescriptor,
        toolchain: &Toolchain,
        timeout_secs: u64,
    ) -> Option<Self> {
        let tree = package.name.as_str();
        let seq = CommandSequence::new(stage.name()).with_timeout(timeout_secs);

        let commands = match stage {
            Stage::Provision | Stage::Compare => return None,
            Stage::Fetch => seq.then(format!(
                "git clone --quiet {} {}",
                shell_quote(&package.details.source),
                shell_quote(tree)
            )),
            Stage::PruneTests => {
                if package.details.excluded_tests.is_empty() {
                    return None;
                }
                // plain `rm`: a listed path that does not exist fails the stage
                package
                    .details
                    .excluded_tests
                    .iter()
                    .fold(seq.in_dir(tree), |seq, path| {
                        seq.then(format!("rm -- {}", shell_quote(path)))
                    })
            }
            Stage::Prerequisites => {
                let seq = seq
                    .in_dir(tree)
                    .then("python -m pip install --quiet pytest")
                    .then(format!("python -m pip install --quiet {}", shell_quote(&toolchain.tool)));
                match &package.details.requirements {
                    Some(file) => {
                        seq.then(format!("python -m pip install --quiet -r {}", shell_quote(file)))
                    }
                    None => seq,
                }
            }
            Stage::BaselineBuild | Stage::OptimizedBuild => {
                let variant = stage.variant().unwrap_or(Variant::Baseline);
                seq.in_dir(tree)
                    .then("rm -rf dist build")
                    .then(format!(
                        "python setup.py {}",
                        shell_quote(toolchain.build_command(variant))
                    ))
            }
            Stage::BaselineInstall | Stage::OptimizedInstall => seq
                .in_dir(tree)
                // runtime requirements come from the wheel's metadata
                .then("python -m pip install --quiet --force-reinstall -U dist/*.whl"),
            Stage::BaselineTest | Stage::OptimizedTest => {
                let mut cmd = "python -m pytest".to_string();
                for arg in &toolchain.pytest_args {
                    cmd.push(' ');
                    cmd.push_str(&shell_quote(arg));
                }
                seq.in_dir(tree).then(cmd)
            }
        };

        Some(Self { stage, commands })
    }

    pub fn label(&self) -> &str {
        &self.commands.label
    }
}

/// Sequence printing the install marker of `package` for `variant`.
///
/// Runs from the environment root so the import resolves to the installed
/// distribution rather than the source tree.
pub fn probe_sequence(package: &PackageDescriptor, variant: Variant, timeout_secs: u64) -> CommandSequence {
    let module = package.module_name();
    let code = format!(
        r#"import {module}; print(getattr({module}, "__compiled__", "__uncompiled_version__"))"#
    );
    CommandSequence::new(format!("{variant}_probe"))
        .with_timeout(timeout_secs)
        .then(format!("python -c {}", shell_quote(&code)))
}

/// Stages that prepare a fresh environment, in order.
pub const PREPARE_STAGES: [Stage; 3] = [Stage::Fetch, Stage::PruneTests, Stage::Prerequisites];

/// Build, install and test stages of a variant, in order.
pub fn variant_stages(variant: Variant) -> [Stage; 3] {
    match variant {
        Variant::Baseline => [Stage::BaselineBuild, Stage::BaselineInstall, Stage::BaselineTest],
        Variant::Optimized => [
            Stage::OptimizedBuild,
            Stage::OptimizedInstall,
            Stage::OptimizedTest,
        ],
    }
}
