//! In-memory environment manager (testing only)
//!
//! `ScriptedEnvironment` satisfies the [`EnvironmentManager`] contract without
//! touching the filesystem. Behaviour is scripted per package and per command
//! sequence label; every call is appended to a log so tests can assert on
//! ordering (e.g. teardown of one package before the next is created).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::EnvError;
use crate::{CapturedOutput, CommandSequence, CommandStatus, EnvHandle, EnvResult, EnvironmentManager};

/// One recorded interaction with the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Create(String),
    Run { env: String, label: String },
    Capture { env: String, label: String },
    Destroy(String),
}

#[derive(Debug, Clone)]
enum Script {
    Exit(i32),
    Timeout,
    SpawnError,
    Output(CapturedOutput),
}

#[derive(Debug, Default)]
struct FakeState {
    live: HashSet<String>,
    created: HashMap<String, usize>,
    destroyed: HashMap<String, usize>,
    calls: Vec<FakeCall>,
    failing_creates: Vec<String>,
    scripts: Vec<(String, String, Script)>,
}

/// Scriptable in-memory [`EnvironmentManager`].
///
/// A script registered for package `p` applies to environments named `p`
/// and `p-<suffix>` (the pipeline's split environments).
#[derive(Debug, Default)]
pub struct ScriptedEnvironment {
    state: Mutex<FakeState>,
}

fn belongs_to(env: &str, package: &str) -> bool {
    env == package
        || env
            .strip_prefix(package)
            .is_some_and(|rest| rest.starts_with('-'))
}

impl ScriptedEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create` fail for every environment of `package`.
    pub fn fail_create(&self, package: &str) {
        self.state.lock().unwrap().failing_creates.push(package.to_string());
    }

    /// Make sequences labelled `label` exit with `exit_code`.
    pub fn fail_stage(&self, package: &str, label: &str, exit_code: i32) {
        self.script(package, label, Script::Exit(exit_code));
    }

    /// Make sequences labelled `label` time out.
    pub fn time_out(&self, package: &str, label: &str) {
        self.script(package, label, Script::Timeout);
    }

    /// Make sequences labelled `label` fail to start.
    pub fn refuse_spawn(&self, package: &str, label: &str) {
        self.script(package, label, Script::SpawnError);
    }

    /// Return `output` from `run_capturing` for sequences labelled `label`.
    pub fn respond(&self, package: &str, label: &str, output: CapturedOutput) {
        self.script(package, label, Script::Output(output));
    }

    fn script(&self, package: &str, label: &str, script: Script) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .push((package.to_string(), label.to_string(), script));
    }

    fn lookup(&self, env: &str, label: &str) -> Option<Script> {
        let state = self.state.lock().unwrap();
        state
            .scripts
            .iter()
            .find(|(pkg, l, _)| l == label && belongs_to(env, pkg))
            .map(|(_, _, s)| s.clone())
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<FakeCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Labels of the sequences run (captured or not) in `env`, in order.
    pub fn labels_for(&self, env: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                FakeCall::Run { env: e, label } | FakeCall::Capture { env: e, label } if e == env => {
                    Some(label)
                }
                _ => None,
            })
            .collect()
    }

    /// How many times an environment called `name` was created.
    pub fn created(&self, name: &str) -> usize {
        self.state.lock().unwrap().created.get(name).copied().unwrap_or(0)
    }

    /// How many times an environment called `name` was torn down.
    pub fn destroyed(&self, name: &str) -> usize {
        self.state.lock().unwrap().destroyed.get(name).copied().unwrap_or(0)
    }

    /// Environments created but not yet destroyed.
    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    fn record(&self, call: FakeCall) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn ensure_live(&self, handle: &EnvHandle) -> EnvResult<()> {
        if self.state.lock().unwrap().live.contains(handle.name()) {
            Ok(())
        } else {
            Err(EnvError::UnknownEnvironment(handle.name().to_string()))
        }
    }

    fn scripted_failure(&self, handle: &EnvHandle, commands: &CommandSequence) -> EnvResult<Option<Script>> {
        match self.lookup(handle.name(), &commands.label) {
            Some(Script::Timeout) => Err(EnvError::Timeout {
                label: commands.label.clone(),
                limit_secs: commands.timeout_secs,
            }),
            Some(Script::SpawnError) => Err(EnvError::Spawn {
                label: commands.label.clone(),
                reason: "scripted spawn failure".to_string(),
            }),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl EnvironmentManager for ScriptedEnvironment {
    async fn create(&self, name: &str) -> EnvResult<EnvHandle> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(FakeCall::Create(name.to_string()));
        if state.failing_creates.iter().any(|pkg| belongs_to(name, pkg)) {
            return Err(EnvError::Provision {
                name: name.to_string(),
                reason: "scripted provisioning failure".to_string(),
            });
        }
        if !state.live.insert(name.to_string()) {
            return Err(EnvError::Provision {
                name: name.to_string(),
                reason: "environment already live".to_string(),
            });
        }
        *state.created.entry(name.to_string()).or_insert(0) += 1;
        Ok(EnvHandle::new(name, PathBuf::from("/fake-envs").join(format!("venv_{name}"))))
    }

    async fn run(&self, handle: &EnvHandle, commands: &CommandSequence) -> EnvResult<CommandStatus> {
        self.record(FakeCall::Run {
            env: handle.name().to_string(),
            label: commands.label.clone(),
        });
        self.ensure_live(handle)?;
        let exit_code = match self.scripted_failure(handle, commands)? {
            Some(Script::Exit(code)) => code,
            _ => 0,
        };
        Ok(CommandStatus {
            label: commands.label.clone(),
            exit_code,
            duration_ms: 0,
            stderr_tail: if exit_code == 0 {
                String::new()
            } else {
                format!("{} failed", commands.label)
            },
        })
    }

    async fn run_capturing(
        &self,
        handle: &EnvHandle,
        commands: &CommandSequence,
    ) -> EnvResult<CapturedOutput> {
        self.record(FakeCall::Capture {
            env: handle.name().to_string(),
            label: commands.label.clone(),
        });
        self.ensure_live(handle)?;
        match self.scripted_failure(handle, commands)? {
            Some(Script::Output(output)) => Ok(output),
            _ => Ok(CapturedOutput::default()),
        }
    }

    fn destroy(&self, handle: &EnvHandle) {
        let mut state = self.state.lock().unwrap();
        if state.live.remove(handle.name()) {
            state.calls.push(FakeCall::Destroy(handle.name().to_string()));
            *state.destroyed.entry(handle.name().to_string()).or_insert(0) += 1;
        }
    }
}
