//! Virtualenv-backed environments
//!
//! Each environment is a directory `<base>/venv_<name>` holding a
//! `python -m venv` interpreter prefix in `.venv/`. Command sequences run
//! under `sh -c` with the prefix's `bin/` first on `PATH`, which is what
//! activating the virtualenv would do.

use crate::error::EnvError;
use crate::{
    tail_lines, CapturedOutput, CommandSequence, CommandStatus, EnvHandle, EnvResult,
    EnvironmentManager, STDERR_TAIL_LINES,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Directory (inside the environment root) holding the interpreter prefix.
pub const VENV_DIR: &str = ".venv";

/// Environment manager creating one virtualenv per environment.
#[derive(Debug, Clone)]
pub struct VirtualenvManager {
    base_dir: PathBuf,
    python: String,
    shell: String,
    provision_timeout_secs: u64,
}

impl VirtualenvManager {
    /// Create a manager placing environments under `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            python: "python3".to_string(),
            shell: "sh".to_string(),
            provision_timeout_secs: 300,
        }
    }

    /// Interpreter used to create the virtualenvs.
    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    /// Time limit for `python -m venv`.
    pub fn with_provision_timeout(mut self, secs: u64) -> Self {
        self.provision_timeout_secs = secs;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Root directory an environment called `name` would use.
    pub fn env_root(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("venv_{name}"))
    }

    fn command_for(&self, handle: &EnvHandle, commands: &CommandSequence) -> Command {
        let bin_dir = handle.root().join(VENV_DIR).join("bin");
        let path = match std::env::var_os("PATH") {
            Some(existing) => {
                let mut paths = vec![bin_dir.clone()];
                paths.extend(std::env::split_paths(&existing));
                std::env::join_paths(paths).unwrap_or(existing)
            }
            None => bin_dir.clone().into_os_string(),
        };

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(commands.script())
            .current_dir(handle.resolve(&commands.workdir))
            .env("PATH", path)
            .env("VIRTUAL_ENV", handle.root().join(VENV_DIR))
            .env_remove("PYTHONHOME")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    async fn execute(&self, handle: &EnvHandle, commands: &CommandSequence) -> EnvResult<(Output, u64)> {
        if commands.is_empty() {
            return Err(EnvError::EmptySequence(commands.label.clone()));
        }
        if !handle.root().is_dir() {
            return Err(EnvError::UnknownEnvironment(handle.name().to_string()));
        }

        debug!(env = %handle, label = %commands.label, script = %commands.script(), "Running command sequence");
        let start = Instant::now();

        let child = self
            .command_for(handle, commands)
            .spawn()
            .map_err(|e| EnvError::Spawn {
                label: commands.label.clone(),
                reason: e.to_string(),
            })?;

        // On timeout or cancellation the whole process group goes, not just `sh`.
        let group = GroupKill { pid: child.id() };
        let output = if commands.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(commands.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| EnvError::Timeout {
                label: commands.label.clone(),
                limit_secs: commands.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };
        group.disarm();

        Ok((output, start.elapsed().as_millis() as u64))
    }
}

#[async_trait]
impl EnvironmentManager for VirtualenvManager {
    async fn create(&self, name: &str) -> EnvResult<EnvHandle> {
        let root = self.env_root(name);
        if root.exists() {
            warn!(env = %name, path = ?root, "Removing stale environment directory");
            remove_tree(&root).map_err(|e| EnvError::Provision {
                name: name.to_string(),
                reason: format!("stale directory {root:?} could not be removed: {e}"),
            })?;
        }
        std::fs::create_dir_all(&root)?;
        let pending = Provisioning {
            manager: self,
            handle: EnvHandle::new(name, root.clone()),
            armed: true,
        };

        let venv_dir = root.join(VENV_DIR);
        let child = Command::new(&self.python)
            .args(["-m", "venv"])
            .arg(&venv_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EnvError::Provision {
                name: name.to_string(),
                reason: format!("could not start {}: {e}", self.python),
            })?;

        let output = tokio::time::timeout(
            Duration::from_secs(self.provision_timeout_secs),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| EnvError::Timeout {
            label: format!("provision {name}"),
            limit_secs: self.provision_timeout_secs,
        })??;

        if !output.status.success() {
            return Err(EnvError::Provision {
                name: name.to_string(),
                reason: tail_lines(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_LINES),
            });
        }

        let handle = pending.keep();
        info!(env = %name, path = ?handle.root(), "Environment created");
        Ok(handle)
    }

    async fn run(&self, handle: &EnvHandle, commands: &CommandSequence) -> EnvResult<CommandStatus> {
        let (output, duration_ms) = self.execute(handle, commands).await?;
        Ok(CommandStatus {
            label: commands.label.clone(),
            exit_code: output.status.code().unwrap_or(-1),
            duration_ms,
            stderr_tail: tail_lines(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_LINES),
        })
    }

    async fn run_capturing(
        &self,
        handle: &EnvHandle,
        commands: &CommandSequence,
    ) -> EnvResult<CapturedOutput> {
        let (output, duration_ms) = self.execute(handle, commands).await?;
        debug!(
            env = %handle,
            label = %commands.label,
            exit_code = output.status.code().unwrap_or(-1),
            duration_ms,
            "Captured command output"
        );
        Ok(CapturedOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn destroy(&self, handle: &EnvHandle) {
        if !handle.root().exists() {
            return;
        }
        match remove_tree(handle.root()) {
            Ok(()) => debug!(env = %handle, "Environment destroyed"),
            Err(e) => warn!(
                event = "env.teardown_failed",
                env = %handle,
                path = ?handle.root(),
                error = %e
            ),
        }
    }
}

/// Removes a half-provisioned environment unless kept.
struct Provisioning<'a> {
    manager: &'a VirtualenvManager,
    handle: EnvHandle,
    armed: bool,
}

impl Provisioning<'_> {
    fn keep(mut self) -> EnvHandle {
        self.armed = false;
        self.handle.clone()
    }
}

impl Drop for Provisioning<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(env = %self.handle, "Discarding partially provisioned environment");
            self.manager.destroy(&self.handle);
        }
    }
}

/// Kills the process group led by a command sequence's shell unless disarmed.
struct GroupKill {
    pid: Option<u32>,
}

impl GroupKill {
    fn disarm(mut self) {
        self.pid = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            kill_group(pid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; a group that already exited yields ESRCH.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "Process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// Remove a directory tree, retrying once after clearing read-only bits
/// (git packs its object files read-only).
fn remove_tree(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(first) => {
            debug!(path = ?path, error = %first, "Retrying removal after clearing read-only bits");
            make_writable(path)?;
            std::fs::remove_dir_all(path)
        }
    }
}

fn make_writable(path: &Path) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    let mut perms = meta.permissions();
    if perms.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        std::fs::set_permissions(path, perms)?;
    }
    if meta.is_dir() {
        for entry in std::fs::read_dir(path)? {
            make_writable(&entry?.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn bare_env(dir: &Path, name: &str) -> (VirtualenvManager, EnvHandle) {
        let manager = VirtualenvManager::new(dir);
        let root = manager.env_root(name);
        std::fs::create_dir_all(&root).unwrap();
        (manager, EnvHandle::new(name, root))
    }

    #[test]
    fn test_env_root_naming() {
        let manager = VirtualenvManager::new("/work");
        assert_eq!(manager.env_root("idna"), PathBuf::from("/work/venv_idna"));
    }

    #[tokio::test]
    async fn test_run_capturing_collects_both_channels() {
        let dir = tempdir().unwrap();
        let (manager, handle) = bare_env(dir.path(), "capture");

        let seq = CommandSequence::new("echo").then("echo out").then("echo err 1>&2");
        let output = manager.run_capturing(&handle, &seq).await.unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_run_capturing_ignores_exit_code() {
        let dir = tempdir().unwrap();
        let (manager, handle) = bare_env(dir.path(), "failing_suite");

        let seq = CommandSequence::new("tests").then("echo '1 failed'; exit 1");
        let output = manager.run_capturing(&handle, &seq).await.unwrap();
        assert!(output.stdout.contains("1 failed"));
    }

    #[tokio::test]
    async fn test_run_reports_nonzero_exit() {
        let dir = tempdir().unwrap();
        let (manager, handle) = bare_env(dir.path(), "exit");

        let seq = CommandSequence::new("build").then("echo broken 1>&2").then("false");
        let status = manager.run(&handle, &seq).await.unwrap();
        assert!(!status.passed());
        assert_eq!(status.label, "build");
        assert!(status.stderr_tail.contains("broken"));
    }

    #[tokio::test]
    async fn test_and_chain_stops_at_first_failure() {
        let dir = tempdir().unwrap();
        let (manager, handle) = bare_env(dir.path(), "chain");

        let seq = CommandSequence::new("chain").then("false").then("touch reached");
        let status = manager.run(&handle, &seq).await.unwrap();
        assert!(!status.passed());
        assert!(!handle.root().join("reached").exists());
    }

    #[tokio::test]
    async fn test_workdir_is_relative_to_root() {
        let dir = tempdir().unwrap();
        let (manager, handle) = bare_env(dir.path(), "workdir");
        std::fs::create_dir_all(handle.root().join("pkg")).unwrap();

        let seq = CommandSequence::new("pwd").in_dir("pkg").then("pwd");
        let output = manager.run_capturing(&handle, &seq).await.unwrap();
        assert!(output.stdout.trim_end().ends_with("venv_workdir/pkg"));
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let dir = tempdir().unwrap();
        let (manager, handle) = bare_env(dir.path(), "slow");

        let seq = CommandSequence::new("slow").then("sleep 5").with_timeout(1);
        let err = manager.run(&handle, &seq).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let dir = tempdir().unwrap();
        let (manager, handle) = bare_env(dir.path(), "orphans");

        let seq = CommandSequence::new("detached")
            .then("(sleep 3 && touch late) & wait")
            .with_timeout(1);
        let err = manager.run(&handle, &seq).await.unwrap_err();
        assert!(err.is_timeout());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!handle.root().join("late").exists());
    }

    fn stalling_python(dir: &Path) -> String {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("slow-python");
        std::fs::write(&script, "#!/bin/sh\nsleep 10\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_provision_timeout_removes_root() {
        let dir = tempdir().unwrap();
        let manager = VirtualenvManager::new(dir.path().join("envs"))
            .with_python(stalling_python(dir.path()))
            .with_provision_timeout(1);

        let err = manager.create("pkg").await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!manager.env_root("pkg").exists());
    }

    #[tokio::test]
    async fn test_cancelled_provision_removes_root() {
        let dir = tempdir().unwrap();
        let manager = VirtualenvManager::new(dir.path().join("envs"))
            .with_python(stalling_python(dir.path()));

        let cancelled = tokio::time::timeout(Duration::from_millis(300), manager.create("pkg")).await;
        assert!(cancelled.is_err());
        assert!(!manager.env_root("pkg").exists());
    }

    #[tokio::test]
    async fn test_failed_provision_removes_root() {
        let dir = tempdir().unwrap();
        let failing = VirtualenvManager::new(dir.path()).with_python("false");
        let err = failing.create("pkg").await.unwrap_err();
        assert!(matches!(err, EnvError::Provision { .. }));
        assert!(!failing.env_root("pkg").exists());

        let missing = VirtualenvManager::new(dir.path()).with_python("/nonexistent/python3");
        let err = missing.create("other").await.unwrap_err();
        assert!(matches!(err, EnvError::Provision { .. }));
        assert!(!missing.env_root("other").exists());
    }

    #[tokio::test]
    async fn test_empty_sequence_rejected() {
        let dir = tempdir().unwrap();
        let (manager, handle) = bare_env(dir.path(), "empty");

        let err = manager
            .run(&handle, &CommandSequence::new("nothing"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::EmptySequence(_)));
    }

    #[tokio::test]
    async fn test_run_in_destroyed_env_fails() {
        let dir = tempdir().unwrap();
        let (manager, handle) = bare_env(dir.path(), "gone");
        manager.destroy(&handle);

        let err = manager
            .run(&handle, &CommandSequence::new("x").then("true"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::UnknownEnvironment(_)));
    }

    #[test]
    fn test_destroy_is_idempotent_and_handles_readonly_files() {
        let dir = tempdir().unwrap();
        let (manager, handle) = bare_env(dir.path(), "readonly");
        let objects = handle.root().join("pkg/.git/objects");
        std::fs::create_dir_all(&objects).unwrap();
        let pack = objects.join("pack");
        std::fs::write(&pack, b"data").unwrap();
        let mut perms = std::fs::metadata(&pack).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&pack, perms).unwrap();

        manager.destroy(&handle);
        assert!(!handle.root().exists());
        manager.destroy(&handle);
    }
}
