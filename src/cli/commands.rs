//! CLI command definitions for swe-runner.
//!
//! Two commands share one set of model, limit and backend flags:
//! `run-one` drives a single instruction, `run-batch` runs a dataset
//! through the batch harness.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use crate::agent::Cancellation;
use crate::batch::BatchOrchestrator;
use crate::execution::{ConfiguredEnvironmentFactory, EnvironmentKind};
use crate::error::LlmError;
use crate::llm::{LiteLlmClient, LlmProvider, ScriptedProvider};
use crate::runner::{run_task, RunConfig, RunContext};
use crate::task::{invalid_id_reason, Task};

/// Autonomous code-repair agent runner.
#[derive(Parser)]
#[command(name = "swe-runner")]
#[command(about = "Run an LLM code-repair agent on one task or a whole dataset")]
#[command(version)]
#[command(
    long_about = "swe-runner drives a language model through propose-command / execute / observe cycles until it submits a result.\n\nExample usage:\n  swe-runner run-one \"Fix the failing test in tests/test_io.py\" --environment local\n  swe-runner run-batch swebench_lite.jsonl --environment container --workers 8 --output ./runs"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the agent on a single instruction.
    #[command(alias = "one")]
    RunOne(RunOneArgs),

    /// Run the agent over a dataset with a bounded worker pool.
    ///
    /// Results are written to the output directory. Tasks that already
    /// have a prediction there are skipped unless --redo-existing is set.
    #[command(alias = "batch")]
    RunBatch(RunBatchArgs),
}

/// Flags shared by every command.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// YAML run configuration. Flags override its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Model identifier.
    #[arg(short, long, env = "SWE_RUNNER_MODEL")]
    pub model: Option<String>,

    /// API key (can also be set via OPENROUTER_API_KEY or LITELLM_API_KEY env var).
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// OpenAI-compatible endpoint. Defaults to OpenRouter.
    #[arg(long, env = "LITELLM_API_BASE")]
    pub api_base: Option<String>,

    /// Maximum model calls per task (0 = unlimited).
    #[arg(long)]
    pub step_limit: Option<usize>,

    /// Maximum dollar cost per task (0 = unlimited).
    #[arg(long)]
    pub cost_limit: Option<f64>,

    /// Per-command timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Execution backend: local, container or sandbox.
    #[arg(short, long)]
    pub environment: Option<EnvironmentKind>,

    /// Working directory inside the environment.
    #[arg(long)]
    pub cwd: Option<String>,

    /// Replay model responses from a JSON/YAML list instead of calling an LLM.
    #[arg(long)]
    pub scripted_responses: Option<PathBuf>,
}

/// Arguments for `swe-runner run-one`.
#[derive(Parser, Debug)]
pub struct RunOneArgs {
    /// Instruction for the agent.
    pub instruction: String,

    /// Task id used in logs, templates and the transcript.
    #[arg(long, value_parser = parse_task_id)]
    pub task_id: Option<String>,

    /// Container image for the container backend.
    #[arg(long)]
    pub image: Option<String>,

    /// Command run once after the environment is provisioned.
    #[arg(long)]
    pub startup_command: Option<String>,

    /// Write the transcript to this file.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// Arguments for `swe-runner run-batch`.
#[derive(Parser, Debug)]
pub struct RunBatchArgs {
    /// Dataset file (.json, .jsonl, .yaml).
    pub dataset: PathBuf,

    /// Only run tasks whose id matches this regex (anchored at the start).
    #[arg(long)]
    pub filter: Option<String>,

    /// Python-style slice of the selected tasks: "10", "0:10", "-5:" or "0:100:2".
    #[arg(long, allow_hyphen_values = true)]
    pub slice: Option<String>,

    /// Shuffle tasks deterministically with this seed before filtering.
    #[arg(long)]
    pub shuffle_seed: Option<u64>,

    /// Number of tasks run concurrently.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Output directory for transcripts and predictions.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Re-run tasks that already have a prediction.
    #[arg(long)]
    pub redo_existing: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

fn parse_task_id(value: &str) -> Result<String, String> {
    match invalid_id_reason(value) {
        Some(reason) => Err(reason.to_string()),
        None => Ok(value.to_string()),
    }
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with already parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::RunOne(args) => run_one_command(args).await,
        Commands::RunBatch(args) => run_batch_command(args).await,
    }
}

// ============================================================================
// run-one
// ============================================================================

async fn run_one_command(args: RunOneArgs) -> anyhow::Result<()> {
    let config = resolve_config(&args.common)?;
    let provider = build_provider(&args.common, &config)?;

    let mut task = match args.task_id {
        Some(id) => Task::new(id, args.instruction),
        None => Task::adhoc(args.instruction),
    };
    if let Some(image) = args.image {
        task = task.with_environment_spec(image);
    }
    if let Some(command) = args.startup_command {
        task = task.with_startup_command(command);
    }

    let environments = Arc::new(ConfiguredEnvironmentFactory::new(config.environment.clone()));
    let cancellation = Cancellation::new();
    cancel_on_ctrl_c(cancellation.clone());
    let ctx = RunContext::new(config, provider, environments).with_cancellation(cancellation);

    info!(task_id = %task.id, model = %ctx.config.model.name, environment = %ctx.config.environment.kind, "Running task");
    let result = run_task(&ctx, &task, None).await;

    if let Some(path) = &args.output {
        result
            .save_transcript(path)
            .map_err(|e| anyhow::anyhow!("Failed to write transcript {}: {}", path.display(), e))?;
        info!(path = %path.display(), "Transcript written");
    }

    println!("Status: {}", result.status_label());
    println!("Calls: {}  Cost: ${:.4}", result.n_calls, result.cost);
    println!("{}", result.result);

    if !result.is_success() {
        anyhow::bail!("Task {} finished with status {}", task.id, result.status_label());
    }
    Ok(())
}

// ============================================================================
// run-batch
// ============================================================================

async fn run_batch_command(args: RunBatchArgs) -> anyhow::Result<()> {
    let mut config = resolve_config(&args.common)?;
    let selection = &mut config.batch.selection;
    if args.filter.is_some() {
        selection.filter = args.filter;
    }
    if args.slice.is_some() {
        selection.slice = args.slice;
    }
    if args.shuffle_seed.is_some() {
        selection.shuffle_seed = args.shuffle_seed;
    }
    if args.redo_existing {
        selection.redo_existing = true;
    }
    if let Some(workers) = args.workers {
        config.batch.workers = workers;
    }
    if let Some(output) = args.output {
        config.batch.output_dir = output;
    }
    config.validate()?;

    let provider = build_provider(&args.common, &config)?;
    let environments = Arc::new(ConfiguredEnvironmentFactory::new(config.environment.clone()));
    let cancellation = Cancellation::new();
    cancel_on_ctrl_c(cancellation.clone());
    let ctx = RunContext::new(config, provider, environments).with_cancellation(cancellation);
    let cost_tracker = Arc::clone(&ctx.cost_tracker);

    let orchestrator = BatchOrchestrator::new(ctx)?;
    let summary = orchestrator.run_dataset(&args.dataset).await?;

    println!("{summary}");
    let report = cost_tracker.report();
    println!("  model calls: {}", report.calls);
    for (model, cost) in &report.by_model {
        println!("  {model}: ${cost:.4}");
    }
    println!(
        "Results written to {}",
        orchestrator.store().output_dir().display()
    );
    Ok(())
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Loads the config file (if any) and applies flag overrides.
fn resolve_config(args: &CommonArgs) -> anyhow::Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_yaml_file(path)?,
        None => RunConfig::new(),
    };

    if let Some(model) = &args.model {
        config.model.name = model.clone();
    }
    if let Some(base) = &args.api_base {
        config.model.api_base = Some(base.clone());
    }
    if let Some(key) = &args.api_key {
        config.model.api_key = Some(key.clone());
    }
    if let Some(step_limit) = args.step_limit {
        config.agent.step_limit = step_limit;
    }
    if let Some(cost_limit) = args.cost_limit {
        config.agent.cost_limit = cost_limit;
    }
    if let Some(kind) = args.environment {
        config.environment.kind = kind;
    }
    if let Some(timeout) = args.timeout {
        config.environment = config.environment.with_timeout(Duration::from_secs(timeout));
    }
    if let Some(cwd) = &args.cwd {
        config.environment = config.environment.with_cwd(cwd.clone());
    }

    config.validate()?;
    Ok(config)
}

/// Picks the model backend: scripted replay, an explicit endpoint, or
/// OpenRouter with an API key.
fn build_provider(args: &CommonArgs, config: &RunConfig) -> anyhow::Result<Arc<dyn LlmProvider>> {
    if let Some(path) = &args.scripted_responses {
        info!(path = %path.display(), "Using scripted model responses");
        return Ok(Arc::new(ScriptedProvider::from_file(path)?));
    }

    let api_key = config
        .model
        .api_key
        .clone()
        .or_else(|| std::env::var("LITELLM_API_KEY").ok());

    match (&config.model.api_base, api_key) {
        (Some(base), key) => {
            info!(api_base = %base, model = %config.model.name, "Using OpenAI-compatible endpoint");
            Ok(Arc::new(LiteLlmClient::new(
                base.clone(),
                key,
                config.model.name.clone(),
            )?))
        }
        (None, Some(key)) => {
            info!(model = %config.model.name, "Using OpenRouter with specified API key");
            Ok(Arc::new(LiteLlmClient::openrouter(
                key,
                config.model.name.clone(),
            )?))
        }
        (None, None) => Err(LlmError::MissingApiKey.into()),
    }
}

fn cancel_on_ctrl_c(cancellation: Cancellation) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received: no new tasks will start, running tasks stop before their next model call");
            cancellation.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_one_defaults() {
        let cli = Cli::try_parse_from(["swe-runner", "run-one", "fix the bug"]).expect("parse");
        match cli.command {
            Commands::RunOne(args) => {
                assert_eq!(args.instruction, "fix the bug");
                assert!(args.task_id.is_none());
                assert!(args.output.is_none());
                assert!(args.common.step_limit.is_none());
            }
            _ => panic!("Expected RunOne command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_run_batch_with_all_options() {
        let cli = Cli::try_parse_from([
            "swe-runner",
            "run-batch",
            "tasks.jsonl",
            "--filter",
            "django",
            "--slice",
            "-5:",
            "--shuffle-seed",
            "7",
            "-w",
            "8",
            "-o",
            "/tmp/runs",
            "--redo-existing",
            "--environment",
            "docker",
            "--step-limit",
            "30",
            "--timeout",
            "90",
            "-l",
            "debug",
        ])
        .expect("parse");

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::RunBatch(args) => {
                assert_eq!(args.dataset, PathBuf::from("tasks.jsonl"));
                assert_eq!(args.filter.as_deref(), Some("django"));
                assert_eq!(args.slice.as_deref(), Some("-5:"));
                assert_eq!(args.shuffle_seed, Some(7));
                assert_eq!(args.workers, Some(8));
                assert!(args.redo_existing);
                assert_eq!(args.common.environment, Some(EnvironmentKind::Container));
                assert_eq!(args.common.step_limit, Some(30));
                assert_eq!(args.common.timeout, Some(90));
            }
            _ => panic!("Expected RunBatch command"),
        }
    }

    #[test]
    fn test_path_like_task_id_rejected() {
        for id in [".", ".."] {
            assert!(
                Cli::try_parse_from(["swe-runner", "run-one", "x", "--task-id", id]).is_err()
            );
        }
        let cli = Cli::try_parse_from(["swe-runner", "run-one", "x", "--task-id", "org/repo-1"])
            .expect("parse");
        match cli.command {
            Commands::RunOne(args) => assert_eq!(args.task_id.as_deref(), Some("org/repo-1")),
            _ => panic!("Expected RunOne command"),
        }
    }

    #[test]
    fn test_invalid_environment_rejected() {
        assert!(Cli::try_parse_from(["swe-runner", "run-one", "x", "--environment", "vm"]).is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let args = CommonArgs {
            model: Some("openai/gpt-4o".to_string()),
            step_limit: Some(5),
            cost_limit: Some(0.5),
            timeout: Some(12),
            environment: Some(EnvironmentKind::Sandbox),
            ..Default::default()
        };
        let config = resolve_config(&args).expect("config");

        assert_eq!(config.model.name, "openai/gpt-4o");
        assert_eq!(config.agent.step_limit, 5);
        assert!((config.agent.cost_limit - 0.5).abs() < 1e-9);
        assert_eq!(config.environment.kind, EnvironmentKind::Sandbox);
        assert_eq!(config.environment.timeout(), Duration::from_secs(12));
    }

    #[test]
    fn test_scripted_provider_needs_no_key() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("responses.yaml");
        std::fs::write(&path, "- \"```bash\\nls\\n```\"\n").expect("write");
        let args = CommonArgs {
            scripted_responses: Some(path),
            ..Default::default()
        };
        let config = resolve_config(&args).expect("config");
        assert!(build_provider(&args, &config).is_ok());
    }
}
