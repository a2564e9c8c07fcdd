//! Execution environments for agent commands.
//!
//! Every backend implements [`Environment`] with the same
//! `execute(command, cwd, timeout)` contract so the agent loop never knows
//! which isolation mechanism it is driving:
//!
//! - [`LocalEnvironment`]: a child process on the host.
//! - [`ContainerEnvironment`]: a Docker container driven through bollard.
//! - [`SandboxEnvironment`]: unprivileged bubblewrap namespaces.
//!
//! Lifecycle:
//! ```text
//! create → setup (provision, once) → execute* → cleanup (exactly once)
//! ```
//!
//! Backends are selected by [`EnvironmentKind`] and built per task by an
//! [`EnvironmentFactory`].

pub mod container;
pub mod docker_client;
pub mod local;
pub mod process;
pub mod sandbox;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::EnvironmentError;
use crate::task::Task;

pub use container::{ContainerEnvironment, ContainerSettings};
pub use docker_client::DockerClient;
pub use local::LocalEnvironment;
pub use sandbox::{SandboxEnvironment, SandboxSettings};

/// Result of one command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Stdout and stderr, merged.
    pub output: String,
    pub return_code: i32,
}

impl Observation {
    pub fn new(output: impl Into<String>, return_code: i32) -> Self {
        Self {
            output: output.into(),
            return_code,
        }
    }
}

/// Available execution backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    #[default]
    Local,
    Container,
    Sandbox,
}

impl EnvironmentKind {
    /// Per-command timeout used when none is configured.
    pub fn default_timeout(&self) -> Duration {
        match self {
            EnvironmentKind::Local | EnvironmentKind::Sandbox => Duration::from_secs(30),
            EnvironmentKind::Container => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentKind::Local => write!(f, "local"),
            EnvironmentKind::Container => write!(f, "container"),
            EnvironmentKind::Sandbox => write!(f, "sandbox"),
        }
    }
}

impl std::str::FromStr for EnvironmentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(EnvironmentKind::Local),
            "container" | "docker" => Ok(EnvironmentKind::Container),
            "sandbox" | "bubblewrap" | "bwrap" => Ok(EnvironmentKind::Sandbox),
            other => Err(format!(
                "unknown environment '{other}': expected local, container or sandbox"
            )),
        }
    }
}

/// A command-execution backend exclusively owned by one task.
#[async_trait]
pub trait Environment: Send {
    fn kind(&self) -> EnvironmentKind;

    /// Working directory commands run in when no `cwd` is given.
    fn cwd(&self) -> String;

    /// Provision the backend. Called once before the first command.
    async fn setup(&mut self) -> Result<(), EnvironmentError>;

    /// Run one shell command.
    ///
    /// `None` for `cwd` or `timeout` selects the backend's configured
    /// default. Timeouts surface as [`EnvironmentError::Timeout`].
    async fn execute(
        &mut self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Observation, EnvironmentError>;

    /// Tear the backend down. Safe to call more than once; only the first
    /// call has an effect.
    async fn cleanup(&mut self);
}

/// Environment variables applied to every command unless overridden.
pub fn default_env_vars() -> BTreeMap<String, String> {
    [
        ("PAGER", "cat"),
        ("MANPAGER", "cat"),
        ("LESS", "-R"),
        ("PIP_PROGRESS_BAR", "off"),
        ("TQDM_DISABLE", "1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Backend selection and per-command settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub kind: EnvironmentKind,
    /// Per-command timeout; `None` uses the backend default.
    pub timeout_secs: Option<u64>,
    /// Working directory for commands; `None` uses the backend default.
    pub cwd: Option<String>,
    /// Extra environment variables for every command.
    pub env: BTreeMap<String, String>,
    /// Startup command for tasks that do not name their own.
    pub startup_command: Option<String>,
    /// Time budget for a task's startup command.
    pub startup_timeout_secs: u64,
    pub container: ContainerSettings,
    pub sandbox: SandboxSettings,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            kind: EnvironmentKind::Local,
            timeout_secs: None,
            cwd: None,
            env: default_env_vars(),
            startup_command: None,
            startup_timeout_secs: 300,
            container: ContainerSettings::default(),
            sandbox: SandboxSettings::default(),
        }
    }
}

impl EnvironmentConfig {
    pub fn new(kind: EnvironmentKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Effective per-command timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.kind.default_timeout())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Builds a fresh environment for each task.
pub trait EnvironmentFactory: Send + Sync {
    fn create(&self, task: &Task) -> Result<Box<dyn Environment>, EnvironmentError>;
}

/// Factory that builds the backend named in an [`EnvironmentConfig`].
#[derive(Debug, Clone)]
pub struct ConfiguredEnvironmentFactory {
    config: EnvironmentConfig,
}

impl ConfiguredEnvironmentFactory {
    pub fn new(config: EnvironmentConfig) -> Self {
        Self { config }
    }
}

impl EnvironmentFactory for ConfiguredEnvironmentFactory {
    fn create(&self, task: &Task) -> Result<Box<dyn Environment>, EnvironmentError> {
        let env: Box<dyn Environment> = match self.config.kind {
            EnvironmentKind::Local => Box::new(LocalEnvironment::new(&self.config)),
            EnvironmentKind::Sandbox => Box::new(SandboxEnvironment::new(&self.config)),
            EnvironmentKind::Container => {
                let client = DockerClient::new()?;
                Box::new(ContainerEnvironment::for_task(client, &self.config, task)?)
            }
        };
        tracing::debug!(task_id = %task.id, kind = %self.config.kind, "Created environment");
        Ok(env)
    }
}
