//! Agent execution loop.
//!
//! Drives one task from provisioning to a terminal state:
//! 1. Set up the environment and run the startup command
//! 2. Render the system and instance prompts
//! 3. Query the model (after checking step and cost limits)
//! 4. Parse exactly one command from the reply
//! 5. Execute it and check the output for a submission sentinel
//! 6. Render the observation and go back to 3
//!
//! Malformed replies and command timeouts are fed back to the model as
//! user messages. Everything else ends the task.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::parser::{ActionParser, FencedBlockParser};
use super::templates::{
    ConfigVars, EnvVars, PromptRenderer, PromptTemplates, RenderVars, StatsVars, TemplateError,
    TruncationConfig,
};
use crate::error::{EnvironmentError, LlmError};
use crate::execution::Environment;
use crate::llm::{Message, ModelClient};
use crate::task::Task;

/// Sentinels accepted unless configured otherwise.
pub const DEFAULT_SENTINELS: [&str; 3] = [
    "COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT",
    "MINI_SWE_AGENT_FINAL_OUTPUT",
    "TASK_COMPLETE",
];

/// Errors raised while driving a task.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The reply did not contain exactly one action.
    #[error("Expected exactly one action, found {found}")]
    Format { found: usize },

    /// The command exceeded its time budget.
    #[error("Command timed out: {command}")]
    ExecutionTimeout { command: String, output: String },

    #[error("Limits exceeded: {calls} calls, ${cost:.4} spent")]
    LimitsExceeded { calls: usize, cost: f64 },

    #[error("Environment setup failed: {0}")]
    EnvironmentSetup(EnvironmentError),

    #[error("Model backend error: {0}")]
    ModelBackend(#[from] LlmError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Environment error: {0}")]
    Environment(EnvironmentError),
}

impl AgentError {
    /// Recoverable errors become a user message and the loop continues.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AgentError::Format { .. } | AgentError::ExecutionTimeout { .. }
        )
    }

    /// Name used as the status for fatal outcomes.
    pub fn kind_name(&self) -> &'static str {
        match self {
            AgentError::Format { .. } => "FormatError",
            AgentError::ExecutionTimeout { .. } => "ExecutionTimeoutError",
            AgentError::LimitsExceeded { .. } => "LimitsExceeded",
            AgentError::EnvironmentSetup(_) => "EnvironmentSetupError",
            AgentError::ModelBackend(_) => "ModelBackendError",
            AgentError::Template(_) => "TemplateError",
            AgentError::Environment(_) => "EnvironmentError",
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Submitted,
    LimitsExceeded,
    Cancelled,
    FatalError { kind: String },
}

impl ExitStatus {
    /// Key used in the status histogram.
    pub fn label(&self) -> &str {
        match self {
            ExitStatus::Submitted => "Submitted",
            ExitStatus::LimitsExceeded => "LimitsExceeded",
            ExitStatus::Cancelled => "Cancelled",
            ExitStatus::FatalError { kind } => kind,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Submitted)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Cooperative stop signal shared between a batch and its running loops.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives per-step progress from a running loop.
pub trait StepObserver: Send + Sync {
    fn on_step(&self, task_id: &str, step: usize, cost: f64);
}

/// Configuration for the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum model calls per task; 0 disables the limit.
    pub step_limit: usize,
    /// Maximum dollar cost per task; 0 disables the limit.
    pub cost_limit: f64,
    /// Exact-match lines that mark a submission.
    pub sentinels: Vec<String>,
    /// Code fence language of the action block.
    pub action_language: String,
    pub templates: PromptTemplates,
    pub truncation: TruncationConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            step_limit: 250,
            cost_limit: 3.0,
            sentinels: DEFAULT_SENTINELS.iter().map(|s| s.to_string()).collect(),
            action_language: "bash".to_string(),
            templates: PromptTemplates::default(),
            truncation: TruncationConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step_limit(mut self, step_limit: usize) -> Self {
        self.step_limit = step_limit;
        self
    }

    pub fn with_cost_limit(mut self, cost_limit: f64) -> Self {
        self.cost_limit = cost_limit;
        self
    }

    pub fn with_sentinels<S: Into<String>>(mut self, sentinels: Vec<S>) -> Self {
        self.sentinels = sentinels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_templates(mut self, templates: PromptTemplates) -> Self {
        self.templates = templates;
        self
    }

    fn limits_reached(&self, calls: usize, cost: f64) -> bool {
        (self.step_limit > 0 && calls >= self.step_limit)
            || (self.cost_limit > 0.0 && cost >= self.cost_limit)
    }
}

/// Detects a submission in command output.
///
/// Leading blank lines and `#` comment lines are skipped. If the next
/// line equals one of `sentinels` (ignoring surrounding whitespace),
/// everything after it is the submitted result, minus trailing line
/// breaks.
pub fn has_finished(output: &str, sentinels: &[String]) -> Option<String> {
    let mut rest = output;
    loop {
        let (line, remainder) = match rest.find('\n') {
            Some(index) => (&rest[..index], &rest[index + 1..]),
            None => (rest, ""),
        };
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            if remainder.is_empty() {
                return None;
            }
            rest = remainder;
            continue;
        }

        if sentinels.iter().any(|s| s == trimmed) {
            return Some(remainder.trim_end_matches(['\n', '\r']).to_string());
        }
        return None;
    }
}

/// Terminal record produced by [`AgentLoop::run`].
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub status: ExitStatus,
    /// Submission text, or a description of why the task stopped.
    pub result: String,
    pub messages: Vec<Message>,
    pub n_calls: usize,
    pub cost: f64,
}

enum Terminal {
    Submitted(String),
    Cancelled,
}

/// Drives one task with exclusively owned model client and environment.
pub struct AgentLoop {
    model: ModelClient,
    env: Box<dyn Environment>,
    renderer: PromptRenderer,
    parser: Box<dyn ActionParser>,
    config: AgentConfig,
    startup_command: Option<String>,
    startup_timeout: Duration,
    cancellation: Option<Cancellation>,
    observer: Option<Arc<dyn StepObserver>>,
    messages: Vec<Message>,
}

impl AgentLoop {
    /// Compiles the configured templates and action parser.
    pub fn new(
        model: ModelClient,
        env: Box<dyn Environment>,
        config: AgentConfig,
    ) -> Result<Self, AgentError> {
        let renderer = PromptRenderer::new(&config.templates, config.truncation)?;
        let parser = FencedBlockParser::new(&config.action_language).map_err(|e| {
            AgentError::Template(TemplateError {
                name: "action_language".to_string(),
                message: e.to_string(),
            })
        })?;
        Ok(Self {
            model,
            env,
            renderer,
            parser: Box::new(parser),
            config,
            startup_command: None,
            startup_timeout: Duration::from_secs(300),
            cancellation: None,
            observer: None,
            messages: Vec::new(),
        })
    }

    /// Replace the action protocol.
    pub fn with_parser(mut self, parser: Box<dyn ActionParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Startup command for tasks that do not carry their own.
    pub fn with_startup(mut self, command: Option<String>, timeout: Duration) -> Self {
        self.startup_command = command;
        self.startup_timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run `task` to a terminal state. The environment is cleaned up
    /// exactly once, whatever the outcome.
    pub async fn run(mut self, task: &Task) -> AgentRun {
        info!(task_id = %task.id, env = %self.env.kind(), "Starting agent loop");
        let outcome = self.drive(task).await;
        self.env.cleanup().await;

        let (status, result) = match outcome {
            Ok(Terminal::Submitted(result)) => (ExitStatus::Submitted, result),
            Ok(Terminal::Cancelled) => (
                ExitStatus::Cancelled,
                "Cancelled before completion".to_string(),
            ),
            Err(err @ AgentError::LimitsExceeded { .. }) => {
                (ExitStatus::LimitsExceeded, err.to_string())
            }
            Err(err) => {
                error!(task_id = %task.id, kind = err.kind_name(), error = %err, "Task failed");
                (
                    ExitStatus::FatalError {
                        kind: err.kind_name().to_string(),
                    },
                    err.to_string(),
                )
            }
        };

        info!(
            task_id = %task.id,
            status = %status,
            n_calls = self.model.n_calls(),
            cost = self.model.cost(),
            "Agent loop finished"
        );

        AgentRun {
            status,
            result,
            n_calls: self.model.n_calls(),
            cost: self.model.cost(),
            messages: self.messages,
        }
    }

    async fn drive(&mut self, task: &Task) -> Result<Terminal, AgentError> {
        self.env
            .setup()
            .await
            .map_err(AgentError::EnvironmentSetup)?;
        self.run_startup(task).await?;

        let system = self.renderer.render_system(&self.vars(task))?;
        let instance = self.renderer.render_instance(&self.vars(task))?;
        self.messages.push(Message::system(system));
        self.messages.push(Message::user(instance));

        loop {
            if self
                .cancellation
                .as_ref()
                .is_some_and(Cancellation::is_cancelled)
            {
                info!(task_id = %task.id, "Cancellation requested, stopping before next call");
                return Ok(Terminal::Cancelled);
            }

            let (calls, cost) = (self.model.n_calls(), self.model.cost());
            if self.config.limits_reached(calls, cost) {
                return Err(AgentError::LimitsExceeded { calls, cost });
            }

            match self.step(task).await {
                Ok(Some(result)) => return Ok(Terminal::Submitted(result)),
                Ok(None) => {}
                Err(err) if err.is_recoverable() => {
                    warn!(task_id = %task.id, kind = err.kind_name(), "Recoverable error, re-prompting");
                    let feedback = self.render_feedback(task, &err)?;
                    self.messages.push(Message::user(feedback));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One model round trip. Returns the submission when the task is done.
    async fn step(&mut self, task: &Task) -> Result<Option<String>, AgentError> {
        let response = self.model.query(&self.messages).await?;
        let content = response.content.clone();
        self.messages.push(response.into_message());

        let step = self.model.n_calls();
        if let Some(observer) = &self.observer {
            observer.on_step(&task.id, step, self.model.cost());
        }

        let command = self
            .parser
            .parse(&content)
            .map_err(|e| AgentError::Format { found: e.found })?;
        debug!(task_id = %task.id, step = step, command = %command, "Executing action");

        let observation = match self.env.execute(&command, None, None).await {
            Ok(observation) => observation,
            Err(EnvironmentError::Timeout { partial_output, .. }) => {
                return Err(AgentError::ExecutionTimeout {
                    command,
                    output: partial_output,
                });
            }
            Err(e) => return Err(AgentError::Environment(e)),
        };

        if let Some(result) = has_finished(&observation.output, &self.config.sentinels) {
            info!(task_id = %task.id, step = step, "Submission received");
            return Ok(Some(result));
        }

        let text = self
            .renderer
            .render_observation(&self.vars(task), &observation)?;
        self.messages.push(Message::user(text));
        Ok(None)
    }

    async fn run_startup(&mut self, task: &Task) -> Result<(), AgentError> {
        let Some(template) = task
            .startup_command
            .clone()
            .or_else(|| self.startup_command.clone())
        else {
            return Ok(());
        };
        let command = self
            .renderer
            .render_str("startup_command", &template, &self.vars(task))?;

        info!(task_id = %task.id, command = %command, "Running startup command");
        let observation = self
            .env
            .execute(&command, None, Some(self.startup_timeout))
            .await
            .map_err(AgentError::EnvironmentSetup)?;

        if observation.return_code != 0 {
            return Err(AgentError::EnvironmentSetup(
                EnvironmentError::StartupFailed {
                    code: observation.return_code,
                    output: observation.output,
                },
            ));
        }
        Ok(())
    }

    fn render_feedback(&self, task: &Task, err: &AgentError) -> Result<String, AgentError> {
        let vars = self.vars(task);
        let text = match err {
            AgentError::Format { found } => {
                self.renderer
                    .render_format_error(&vars, *found, self.parser.language())?
            }
            AgentError::ExecutionTimeout { command, output } => {
                self.renderer.render_timeout(&vars, command, output)?
            }
            _ => err.to_string(),
        };
        Ok(text)
    }

    fn vars<'a>(&self, task: &'a Task) -> RenderVars<'a> {
        RenderVars {
            task,
            config: ConfigVars {
                step_limit: self.config.step_limit,
                cost_limit: self.config.cost_limit,
                sentinel: self
                    .config
                    .sentinels
                    .first()
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_SENTINELS[2].to_string()),
                sentinels: self.config.sentinels.clone(),
            },
            stats: StatsVars {
                n_calls: self.model.n_calls(),
                cost: self.model.cost(),
            },
            env: EnvVars {
                kind: self.env.kind().to_string(),
                cwd: self.env.cwd(),
            },
        }
    }
}
