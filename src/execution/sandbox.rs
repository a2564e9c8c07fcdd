//! Bubblewrap sandbox backend.
//!
//! Each command runs in fresh unprivileged namespaces with the host's
//! system directories mounted read-only and a private scratch directory
//! bound read-write. Linux only.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::process::run_with_timeout;
use super::{Environment, EnvironmentConfig, EnvironmentKind, Observation};
use crate::error::EnvironmentError;

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/sbin:/usr/bin:/bin";

/// Bubblewrap-specific settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Path to the `bwrap` binary.
    pub executable: String,
    /// Arguments placed before the per-command binds.
    pub wrapper_args: Vec<String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        let executable =
            std::env::var("SWE_RUNNER_BWRAP_EXECUTABLE").unwrap_or_else(|_| "bwrap".to_string());
        let mut wrapper_args = vec!["--unshare-user-try".to_string()];
        for dir in ["/usr", "/bin", "/lib", "/lib64", "/etc"] {
            wrapper_args.extend(["--ro-bind".to_string(), dir.to_string(), dir.to_string()]);
        }
        wrapper_args.extend(
            [
                "--tmpfs",
                "/tmp",
                "--proc",
                "/proc",
                "--dev",
                "/dev",
                "--new-session",
                "--setenv",
                "PATH",
                SANDBOX_PATH,
            ]
            .map(String::from),
        );
        Self {
            executable,
            wrapper_args,
        }
    }
}

/// Runs commands through `bwrap` inside a private working directory.
pub struct SandboxEnvironment {
    settings: SandboxSettings,
    configured_cwd: Option<String>,
    env: BTreeMap<String, String>,
    timeout: Duration,
    workdir: Option<TempDir>,
}

impl SandboxEnvironment {
    pub fn new(config: &EnvironmentConfig) -> Self {
        Self {
            settings: config.sandbox.clone(),
            configured_cwd: config.cwd.clone(),
            env: config.env.clone(),
            timeout: config.timeout(),
            workdir: None,
        }
    }

    fn workdir_path(&self) -> Option<PathBuf> {
        self.workdir.as_ref().map(|dir| dir.path().to_path_buf())
    }

    /// Full `bwrap` argument vector for one command.
    fn build_args(&self, command: &str, cwd: &str) -> Vec<String> {
        let mut args = self.settings.wrapper_args.clone();
        args.extend([
            "--bind".to_string(),
            cwd.to_string(),
            cwd.to_string(),
            "--chdir".to_string(),
            cwd.to_string(),
        ]);
        for (key, value) in &self.env {
            args.extend(["--setenv".to_string(), key.clone(), value.clone()]);
        }
        args.extend(["bash".to_string(), "-c".to_string(), command.to_string()]);
        args
    }
}

#[async_trait]
impl Environment for SandboxEnvironment {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Sandbox
    }

    fn cwd(&self) -> String {
        self.configured_cwd
            .clone()
            .or_else(|| self.workdir_path().map(|p| p.display().to_string()))
            .unwrap_or_default()
    }

    async fn setup(&mut self) -> Result<(), EnvironmentError> {
        if self.workdir.is_some() {
            return Ok(());
        }

        let version = Command::new(&self.settings.executable)
            .arg("--version")
            .output()
            .await
            .map_err(|e| {
                EnvironmentError::SetupFailed(format!(
                    "bubblewrap executable '{}' not usable: {e}",
                    self.settings.executable
                ))
            })?;
        if !version.status.success() {
            return Err(EnvironmentError::SetupFailed(format!(
                "'{} --version' exited with {}",
                self.settings.executable, version.status
            )));
        }

        let workdir = tempfile::Builder::new()
            .prefix("swe-runner-")
            .tempdir()
            .map_err(|e| EnvironmentError::SetupFailed(format!("cannot create workdir: {e}")))?;
        info!(workdir = %workdir.path().display(), "Sandbox ready");
        self.workdir = Some(workdir);
        Ok(())
    }

    async fn execute(
        &mut self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Observation, EnvironmentError> {
        if self.workdir.is_none() {
            return Err(EnvironmentError::NotReady);
        }
        let cwd = cwd.map(str::to_string).unwrap_or_else(|| self.cwd());
        debug!(cwd = %cwd, command = command, "Executing sandboxed command");

        let mut child = Command::new(&self.settings.executable);
        child.args(self.build_args(command, &cwd));

        let output = run_with_timeout(child, timeout.unwrap_or(self.timeout)).await?;
        Ok(Observation::new(output.output, output.return_code))
    }

    async fn cleanup(&mut self) {
        if let Some(workdir) = self.workdir.take() {
            let path = workdir.path().display().to_string();
            if let Err(e) = workdir.close() {
                warn!(workdir = %path, error = %e, "Failed to remove sandbox workdir");
            } else {
                debug!(workdir = %path, "Sandbox workdir removed");
            }
        }
    }
}

impl Drop for SandboxEnvironment {
    fn drop(&mut self) {
        if let Some(workdir) = &self.workdir {
            warn!(
                "Sandbox {} was not cleaned up properly",
                workdir.path().display()
            );
        }
    }
}
