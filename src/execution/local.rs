//! Host-process backend.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use super::process::run_with_timeout;
use super::{Environment, EnvironmentConfig, EnvironmentKind, Observation};
use crate::error::EnvironmentError;

/// Runs each command with `sh -c` directly on the host.
pub struct LocalEnvironment {
    cwd: String,
    env: BTreeMap<String, String>,
    timeout: Duration,
}

impl LocalEnvironment {
    pub fn new(config: &EnvironmentConfig) -> Self {
        let cwd = config.cwd.clone().unwrap_or_else(|| {
            std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| ".".to_string())
        });
        Self {
            cwd,
            env: config.env.clone(),
            timeout: config.timeout(),
        }
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Local
    }

    fn cwd(&self) -> String {
        self.cwd.clone()
    }

    async fn setup(&mut self) -> Result<(), EnvironmentError> {
        if !std::path::Path::new(&self.cwd).is_dir() {
            return Err(EnvironmentError::SetupFailed(format!(
                "working directory '{}' does not exist",
                self.cwd
            )));
        }
        Ok(())
    }

    async fn execute(
        &mut self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Observation, EnvironmentError> {
        let cwd = cwd.unwrap_or(&self.cwd);
        debug!(cwd = cwd, command = command, "Executing local command");

        let mut child = Command::new("sh");
        child
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .envs(&self.env);

        let output = run_with_timeout(child, timeout.unwrap_or(self.timeout)).await?;
        Ok(Observation::new(output.output, output.return_code))
    }

    async fn cleanup(&mut self) {}
}
