//! swe-runner: autonomous code-repair agent runtime.
//!
//! A single-task loop drives a language model through
//! propose-command / execute / observe cycles inside an isolated
//! environment, and a batch harness runs many such loops under a bounded
//! worker pool with resumable output.

pub mod agent;
pub mod batch;
pub mod cli;
pub mod error;
pub mod execution;
pub mod llm;
pub mod runner;
pub mod task;

// Re-export commonly used types
pub use agent::{AgentConfig, AgentError, AgentLoop, Cancellation, ExitStatus};
pub use batch::{BatchConfig, BatchOrchestrator, BatchSummary};
pub use error::{
    ArtifactError, BatchError, ConfigError, DatasetError, EnvironmentError, LlmError,
};
pub use execution::{Environment, EnvironmentConfig, EnvironmentKind, Observation};
pub use runner::{run_task, ExecutionResult, RunConfig, RunContext};
pub use task::{load_tasks, Task};
