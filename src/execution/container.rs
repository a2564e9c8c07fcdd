//! Docker container backend.
//!
//! One long-lived container per task: pulled and created during setup,
//! kept alive with a `sleep` entrypoint, driven with `docker exec`, and
//! force-removed on cleanup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::docker_client::{ContainerLimits, ContainerSpec, DockerClient};
use super::{Environment, EnvironmentConfig, EnvironmentKind, Observation};
use crate::error::EnvironmentError;
use crate::task::Task;

/// Image naming scheme for SWE-bench evaluation images.
pub const DEFAULT_IMAGE_TEMPLATE: &str =
    "docker.io/swebench/sweb.eval.x86_64.{{ task.id | replace(from=\"__\", to=\"_1776_\") | lower }}:latest";

/// Container-specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Fixed image for every task. Tasks that name their own image win.
    pub image: Option<String>,
    /// Tera template rendered with `task` when neither the task nor
    /// `image` names one.
    pub image_template: String,
    pub pull_timeout_secs: u64,
    /// Lifetime of the keep-alive process.
    pub keep_alive_secs: u64,
    pub name_prefix: String,
    pub network_mode: Option<String>,
    pub limits: ContainerLimits,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: None,
            image_template: DEFAULT_IMAGE_TEMPLATE.to_string(),
            pull_timeout_secs: 600,
            keep_alive_secs: 7200,
            name_prefix: "swe-runner".to_string(),
            network_mode: Some("bridge".to_string()),
            limits: ContainerLimits::default(),
        }
    }
}

impl ContainerSettings {
    /// Image for `task`: the task's own image, then the fixed image, then
    /// the rendered template.
    pub fn resolve_image(&self, task: &Task) -> Result<String, EnvironmentError> {
        if let Some(image) = task.environment_spec.as_deref().filter(|s| !s.is_empty()) {
            return Ok(image.to_string());
        }
        if let Some(image) = self.image.as_deref().filter(|s| !s.is_empty()) {
            return Ok(image.to_string());
        }

        let mut context = tera::Context::new();
        context.insert("task", task);
        tera::Tera::one_off(&self.image_template, &context, false)
            .map(|s| s.trim().to_string())
            .map_err(|e| {
                EnvironmentError::SetupFailed(format!("cannot render image template: {e}"))
            })
    }
}

/// Deterministic container name for a task, so leftovers from an
/// interrupted run can be found and removed.
///
/// The readable part is lossy, so a digest of the raw id keeps two tasks
/// from ever sharing (and removing) one container.
pub fn container_name(prefix: &str, task_id: &str) -> String {
    let safe: String = task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let digest = hex::encode(Sha256::digest(task_id.as_bytes()));
    format!("{prefix}-{safe}-{}", &digest[..10])
}

/// A task container reached through the local Docker daemon.
pub struct ContainerEnvironment {
    client: DockerClient,
    image: String,
    name: String,
    cwd: String,
    env: Vec<String>,
    timeout: Duration,
    settings: ContainerSettings,
    container_id: Option<String>,
}

impl ContainerEnvironment {
    pub fn for_task(
        client: DockerClient,
        config: &EnvironmentConfig,
        task: &Task,
    ) -> Result<Self, EnvironmentError> {
        let settings = config.container.clone();
        Ok(Self {
            client,
            image: settings.resolve_image(task)?,
            name: container_name(&settings.name_prefix, &task.id),
            cwd: config.cwd.clone().unwrap_or_else(|| "/testbed".to_string()),
            env: config.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            timeout: config.timeout(),
            settings,
            container_id: None,
        })
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }
}

#[async_trait]
impl Environment for ContainerEnvironment {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Container
    }

    fn cwd(&self) -> String {
        self.cwd.clone()
    }

    async fn setup(&mut self) -> Result<(), EnvironmentError> {
        if self.container_id.is_some() {
            return Ok(());
        }

        if !self.client.has_image(&self.image).await {
            info!(image = %self.image, "Pulling image");
            self.client
                .pull_image(
                    &self.image,
                    Duration::from_secs(self.settings.pull_timeout_secs),
                )
                .await?;
        }

        if self.client.remove_stale(&self.name).await? {
            warn!(container = %self.name, "Removed stale container from an earlier run");
        }

        let spec = ContainerSpec::new(&self.name, &self.image)
            .with_cmd(vec![
                "sleep".to_string(),
                self.settings.keep_alive_secs.to_string(),
            ])
            .with_env(self.env.clone())
            .with_working_dir(&self.cwd)
            .with_limits(self.settings.limits.clone())
            .with_network(self.settings.network_mode.clone());

        let id = self.client.create_container(&spec).await?;
        // Record the id before starting so a failed start is still cleaned up.
        self.container_id = Some(id.clone());
        self.client.start_container(&id).await?;

        info!(container = %self.name, image = %self.image, "Container started");
        Ok(())
    }

    async fn execute(
        &mut self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Observation, EnvironmentError> {
        let id = self
            .container_id
            .clone()
            .ok_or(EnvironmentError::NotReady)?;
        let cwd = cwd.unwrap_or(&self.cwd).to_string();
        debug!(container = %self.name, cwd = %cwd, command = command, "Executing in container");

        let result = self
            .client
            .exec(
                &id,
                vec!["bash".to_string(), "-lc".to_string(), command.to_string()],
                self.env.clone(),
                Some(cwd),
                timeout.unwrap_or(self.timeout),
            )
            .await?;

        Ok(Observation::new(result.output, result.exit_code as i32))
    }

    async fn cleanup(&mut self) {
        if let Some(id) = self.container_id.take() {
            match self.client.remove_container(&id).await {
                Ok(()) => debug!(container = %self.name, "Container removed"),
                Err(EnvironmentError::ContainerNotFound { .. }) => {}
                Err(e) => warn!(container = %self.name, error = %e, "Failed to remove container"),
            }
        }
    }
}

impl Drop for ContainerEnvironment {
    fn drop(&mut self) {
        if self.container_id.is_some() {
            warn!("Container {} was not cleaned up properly", self.name);
        }
    }
}
