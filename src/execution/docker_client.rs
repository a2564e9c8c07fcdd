//! Thin bollard wrapper for task containers.
//!
//! Only the operations the container backend needs: image presence and
//! pulls, create/start/remove, and exec with a host-side deadline.

use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::EnvironmentError;

const CPU_PERIOD_US: i64 = 100_000;

/// Resource caps applied to a task container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerLimits {
    pub memory_mb: u64,
    /// Fractional cores, e.g. 0.5 or 2.0.
    pub cpu_cores: f64,
    pub max_processes: u64,
}

impl Default for ContainerLimits {
    fn default() -> Self {
        Self {
            memory_mb: 4096,
            cpu_cores: 2.0,
            max_processes: 1024,
        }
    }
}

impl ContainerLimits {
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb << 20) as i64
    }

    /// CFS quota for a 100ms period.
    pub fn cpu_quota(&self) -> i64 {
        (CPU_PERIOD_US as f64 * self.cpu_cores).round() as i64
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub limits: ContainerLimits,
    pub network_mode: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            limits: ContainerLimits::default(),
            network_mode: Some("bridge".to_string()),
        }
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_limits(mut self, limits: ContainerLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Docker network mode; `None` leaves the daemon default.
    pub fn with_network(mut self, mode: Option<String>) -> Self {
        self.network_mode = mode;
        self
    }

    fn host_config(&self) -> HostConfig {
        HostConfig {
            memory: Some(self.limits.memory_bytes()),
            cpu_period: Some(CPU_PERIOD_US),
            cpu_quota: Some(self.limits.cpu_quota()),
            pids_limit: Some(self.limits.max_processes as i64),
            network_mode: self.network_mode.clone(),
            ..Default::default()
        }
    }
}

/// Output of a command run with `docker exec`, stdout and stderr merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub output: String,
    pub exit_code: i64,
}

/// Handle to the local Docker daemon.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentError::DaemonUnavailable` if the daemon socket
    /// cannot be opened.
    pub fn new() -> Result<Self, EnvironmentError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EnvironmentError::DaemonUnavailable(format!("Failed to connect: {e}")))?;
        Ok(Self { docker })
    }

    /// Creates a container and returns its ID. Does not start it.
    pub async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EnvironmentError> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: non_empty(&spec.cmd),
            env: non_empty(&spec.env),
            working_dir: spec.working_dir.clone(),
            host_config: Some(spec.host_config()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                EnvironmentError::SetupFailed(format!("Failed to create container: {e}"))
            })?;

        Ok(response.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), EnvironmentError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| EnvironmentError::SetupFailed(format!("Failed to start container: {e}")))
    }

    /// Force-removes a container and its anonymous volumes.
    pub async fn remove_container(&self, id: &str) -> Result<(), EnvironmentError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| not_found_or(id, e, "Failed to remove container"))
    }

    /// Removes a leftover container with this name from an earlier run.
    ///
    /// Returns whether anything was removed.
    pub async fn remove_stale(&self, name: &str) -> Result<bool, EnvironmentError> {
        match self.remove_container(name).await {
            Ok(()) => Ok(true),
            Err(EnvironmentError::ContainerNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Runs `cmd` inside a running container.
    ///
    /// If `timeout` elapses first, returns `EnvironmentError::Timeout` with
    /// the output read so far. The process inside the container is not
    /// signalled and lives on until the container is removed.
    pub async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        env: Vec<String>,
        working_dir: Option<String>,
        timeout: Duration,
    ) -> Result<ExecOutput, EnvironmentError> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            env: non_empty(&env),
            working_dir,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(|e| not_found_or(id, e, "Failed to create exec"))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| EnvironmentError::ExecFailed(format!("Failed to start exec: {e}")))?;

        // Frames can split a UTF-8 sequence, so decode only once at the end.
        let mut raw = Vec::new();
        if let StartExecResults::Attached { output: stream, .. } = started {
            match tokio::time::timeout(timeout, drain_into(stream, &mut raw)).await {
                Ok(drained) => drained?,
                Err(_) => {
                    return Err(EnvironmentError::Timeout {
                        seconds: timeout.as_secs(),
                        partial_output: String::from_utf8_lossy(&raw).into_owned(),
                    })
                }
            }
        }
        let output = String::from_utf8_lossy(&raw).into_owned();

        let info = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| EnvironmentError::ExecFailed(format!("Failed to inspect exec: {e}")))?;

        Ok(ExecOutput {
            output,
            exit_code: info.exit_code.unwrap_or(-1),
        })
    }

    /// Pulls an image, giving up after `timeout`.
    pub async fn pull_image(&self, image: &str, timeout: Duration) -> Result<(), EnvironmentError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let pull = async {
            let mut stream = self.docker.create_image(Some(options), None, None);
            while let Some(result) = stream.next().await {
                result.map_err(|e| EnvironmentError::ImagePullFailed {
                    image: image.to_string(),
                    reason: e.to_string(),
                })?;
            }
            Ok(())
        };

        tokio::time::timeout(timeout, pull)
            .await
            .map_err(|_| EnvironmentError::ImagePullFailed {
                image: image.to_string(),
                reason: format!("pull did not finish within {}s", timeout.as_secs()),
            })?
    }

    pub async fn has_image(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

/// Appends every output frame to `buf`, whichever stream it came from.
async fn drain_into<S>(mut frames: S, buf: &mut Vec<u8>) -> Result<(), EnvironmentError>
where
    S: futures::Stream<Item = Result<LogOutput, BollardError>> + Unpin,
{
    while let Some(frame) = frames.next().await {
        match frame.map_err(|e| EnvironmentError::ExecFailed(format!("Error reading output: {e}")))? {
            LogOutput::StdOut { message }
            | LogOutput::StdErr { message }
            | LogOutput::Console { message } => buf.extend_from_slice(&message),
            LogOutput::StdIn { .. } => {}
        }
    }
    Ok(())
}

fn not_found_or(id: &str, error: BollardError, context: &str) -> EnvironmentError {
    match error {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => EnvironmentError::ContainerNotFound { id: id.to_string() },
        other => EnvironmentError::ExecFailed(format!("{context}: {other}")),
    }
}
