//! Task runner.
//!
//! Turns one [`Task`] into one [`ExecutionResult`]:
//!
//! ```text
//! Task → EnvironmentFactory → AgentLoop(ModelClient, Environment) → ExecutionResult
//! ```
//!
//! All shared state lives in a [`RunContext`] passed by reference; there are
//! no process-wide clients or counters.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use swe_runner::runner::{run_task, RunConfig, RunContext};
//! use swe_runner::execution::ConfiguredEnvironmentFactory;
//!
//! let config = RunConfig::from_yaml_file("run.yaml".as_ref())?;
//! let environments = Arc::new(ConfiguredEnvironmentFactory::new(config.environment.clone()));
//! let ctx = RunContext::new(config, provider, environments);
//!
//! let result = run_task(&ctx, &task, None).await;
//! println!("{}: {}", result.status_label(), result.result);
//! ```

pub mod config;
pub mod result;

use std::sync::Arc;

use chrono::Utc;
use tracing::error;

use crate::agent::{AgentLoop, Cancellation, StepObserver};
use crate::execution::EnvironmentFactory;
use crate::llm::{CostTracker, LlmProvider, ModelClient};
use crate::task::Task;

pub use config::RunConfig;
pub use result::{write_atomic, ExecutionResult, ModelStats, Transcript, TranscriptInfo};

/// Run-scoped collaborators shared by every task of a run.
#[derive(Clone)]
pub struct RunContext {
    pub config: Arc<RunConfig>,
    pub provider: Arc<dyn LlmProvider>,
    pub environments: Arc<dyn EnvironmentFactory>,
    pub cost_tracker: Arc<CostTracker>,
    pub cancellation: Cancellation,
}

impl RunContext {
    pub fn new(
        config: RunConfig,
        provider: Arc<dyn LlmProvider>,
        environments: Arc<dyn EnvironmentFactory>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            environments,
            cost_tracker: Arc::new(CostTracker::new()),
            cancellation: Cancellation::new(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Configuration recorded in transcripts.
    fn config_snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&*self.config).unwrap_or(serde_json::Value::Null)
    }
}

/// Runs `task` to a terminal state with a fresh model client and
/// environment. Never fails: every outcome is an [`ExecutionResult`].
pub async fn run_task(
    ctx: &RunContext,
    task: &Task,
    observer: Option<Arc<dyn StepObserver>>,
) -> ExecutionResult {
    let started_at = Utc::now();
    let model_name = ctx.config.model.name.clone();

    let env = match ctx.environments.create(task) {
        Ok(env) => env,
        Err(e) => {
            error!(task_id = %task.id, error = %e, "Failed to create environment");
            return ExecutionResult::fatal(
                &task.id,
                model_name,
                "EnvironmentSetupError",
                e.to_string(),
                started_at,
                ctx.config_snapshot(),
            );
        }
    };

    let model = ModelClient::new(Arc::clone(&ctx.provider), ctx.config.model.clone())
        .with_tracker(Arc::clone(&ctx.cost_tracker));

    let agent = match AgentLoop::new(model, env, ctx.config.agent.clone()) {
        Ok(agent) => agent,
        Err(e) => {
            error!(task_id = %task.id, error = %e, "Invalid agent configuration");
            return ExecutionResult::fatal(
                &task.id,
                model_name,
                e.kind_name(),
                e.to_string(),
                started_at,
                ctx.config_snapshot(),
            );
        }
    };

    let mut agent = agent
        .with_startup(
            ctx.config.environment.startup_command.clone(),
            ctx.config.environment.startup_timeout(),
        )
        .with_cancellation(ctx.cancellation.clone());
    if let Some(observer) = observer {
        agent = agent.with_observer(observer);
    }

    let run = agent.run(task).await;
    ExecutionResult::from_run(&task.id, model_name, run, started_at, ctx.config_snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ExitStatus;
    use crate::error::EnvironmentError;
    use crate::execution::{ConfiguredEnvironmentFactory, Environment, EnvironmentConfig};
    use crate::llm::ScriptedProvider;

    struct BrokenFactory;

    impl EnvironmentFactory for BrokenFactory {
        fn create(&self, _task: &Task) -> Result<Box<dyn Environment>, EnvironmentError> {
            Err(EnvironmentError::DaemonUnavailable("socket missing".to_string()))
        }
    }

    #[tokio::test]
    async fn test_factory_failure_is_setup_error() {
        let provider = Arc::new(ScriptedProvider::repeating("```bash\nls\n```"));
        let ctx = RunContext::new(RunConfig::new(), provider.clone(), Arc::new(BrokenFactory));

        let result = run_task(&ctx, &Task::new("t", "x"), None).await;

        assert_eq!(result.status_label(), "EnvironmentSetupError");
        assert!(result.result.contains("socket missing"));
        assert_eq!(provider.attempts(), 0);
    }

    #[tokio::test]
    async fn test_invalid_template_is_fatal() {
        let mut config = RunConfig::new();
        config.agent.templates.system_template = "{% if %}".to_string();
        let provider = Arc::new(ScriptedProvider::repeating("```bash\nls\n```"));
        let ctx = RunContext::new(
            config,
            provider,
            Arc::new(ConfiguredEnvironmentFactory::new(EnvironmentConfig::default())),
        );

        let result = run_task(&ctx, &Task::new("t", "x"), None).await;
        assert_eq!(result.status_label(), "TemplateError");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_end_to_end() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let provider = Arc::new(
            ScriptedProvider::new(vec![
                "THOUGHT: finish\n\n```bash\nprintf 'TASK_COMPLETE\\nok\\n'\n```",
            ])
            .with_cost_per_call(0.01),
        );
        let env = EnvironmentConfig::default().with_cwd(dir.path().display().to_string());
        let ctx = RunContext::new(
            RunConfig::new().with_environment(env.clone()),
            provider,
            Arc::new(ConfiguredEnvironmentFactory::new(env)),
        );

        let result = run_task(&ctx, &Task::new("local-1", "say ok"), None).await;

        assert_eq!(result.status, ExitStatus::Submitted);
        assert_eq!(result.result, "ok");
        assert_eq!(result.n_calls, 1);
        assert!((ctx.cost_tracker.total_cost() - 0.01).abs() < 1e-9);
        assert_eq!(result.config["environment"]["kind"], "local");
    }
}
