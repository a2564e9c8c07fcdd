//! Configuration for agent runs.
//!
//! A single YAML document with four optional sections:
//!
//! ```yaml
//! model:
//!   name: anthropic/claude-sonnet-4
//!   temperature: 0.0
//! agent:
//!   step_limit: 250
//!   cost_limit: 3.0
//! environment:
//!   kind: container
//!   timeout_secs: 60
//! batch:
//!   workers: 4
//!   output_dir: ./runs
//! ```
//!
//! Every field has a default; command-line flags are applied on top.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentConfig;
use crate::batch::BatchConfig;
use crate::error::ConfigError;
use crate::execution::{EnvironmentConfig, EnvironmentKind};
use crate::llm::ModelConfig;

/// Complete configuration for single and batch runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: ModelConfig,
    pub agent: AgentConfig,
    pub environment: EnvironmentConfig,
    pub batch: BatchConfig,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads and validates a YAML config file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values no run could work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.name.trim().is_empty() {
            return Err(invalid("model.name", "must not be empty"));
        }
        if !self.agent.cost_limit.is_finite() || self.agent.cost_limit < 0.0 {
            return Err(invalid("agent.cost_limit", "must be a non-negative number"));
        }
        if self.agent.sentinels.iter().all(|s| s.trim().is_empty()) {
            return Err(invalid("agent.sentinels", "at least one sentinel is required"));
        }
        if self.agent.action_language.trim().is_empty() {
            return Err(invalid("agent.action_language", "must not be empty"));
        }
        if self.environment.timeout_secs == Some(0) {
            return Err(invalid("environment.timeout_secs", "must be positive"));
        }
        if self.batch.workers == 0 {
            return Err(invalid("batch.workers", "must be at least 1"));
        }
        Ok(())
    }

    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentConfig) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_environment_kind(mut self, kind: EnvironmentKind) -> Self {
        self.environment.kind = kind;
        self
    }

    pub fn with_step_limit(mut self, step_limit: usize) -> Self {
        self.agent.step_limit = step_limit;
        self
    }

    pub fn with_cost_limit(mut self, cost_limit: f64) -> Self {
        self.agent.cost_limit = cost_limit;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.environment.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.batch.workers = workers;
        self
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RunConfig::new();
        assert_eq!(config.agent.step_limit, 250);
        assert_eq!(config.agent.cost_limit, 3.0);
        assert_eq!(config.environment.kind, EnvironmentKind::Local);
        assert!(config.batch.workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = RunConfig::from_yaml_str(
            "model:\n  name: openai/gpt-4o\nagent:\n  step_limit: 5\nenvironment:\n  kind: container\n  container:\n    image: python:3.11\n",
        )
        .expect("parse");

        assert_eq!(config.model.name, "openai/gpt-4o");
        assert_eq!(config.agent.step_limit, 5);
        assert_eq!(config.agent.cost_limit, 3.0);
        assert_eq!(config.environment.kind, EnvironmentKind::Container);
        assert_eq!(config.environment.container.image.as_deref(), Some("python:3.11"));
        assert_eq!(config.environment.container.keep_alive_secs, 7200);
    }

    #[test]
    fn test_custom_sentinels_from_yaml() {
        let config =
            RunConfig::from_yaml_str("agent:\n  sentinels: [DONE, FINISHED]\n").expect("parse");
        assert_eq!(config.agent.sentinels, vec!["DONE", "FINISHED"]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = RunConfig::from_yaml_str("batch:\n  workers: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field, .. } if field == "batch.workers"));

        let err = RunConfig::from_yaml_str("agent:\n  cost_limit: -1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field, .. } if field == "agent.cost_limit"));

        let err = RunConfig::from_yaml_str("agent:\n  sentinels: []\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            RunConfig::from_yaml_str("agent: [unclosed"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("run.yaml");
        std::fs::write(&path, "environment:\n  kind: sandbox\n").expect("write");

        let config = RunConfig::from_yaml_file(&path).expect("load");
        assert_eq!(config.environment.kind, EnvironmentKind::Sandbox);

        let missing = RunConfig::from_yaml_file(&dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_builder() {
        let config = RunConfig::new()
            .with_environment_kind(EnvironmentKind::Sandbox)
            .with_step_limit(3)
            .with_cost_limit(0.5)
            .with_command_timeout(Duration::from_secs(9))
            .with_workers(8);

        assert_eq!(config.environment.timeout(), Duration::from_secs(9));
        assert_eq!(config.agent.step_limit, 3);
        assert_eq!(config.batch.workers, 8);
    }

    #[test]
    fn test_api_key_never_serialized() {
        let config = RunConfig::new().with_model(ModelConfig::new("m").with_api_key("sk-secret"));
        let yaml = serde_yaml::to_string(&config).expect("serialize");
        assert!(!yaml.contains("sk-secret"));
    }
}
