//! Error types for swe-runner operations.
//!
//! Defines error types for the major subsystems:
//! - LLM API interactions
//! - Execution environments (local process, container, sandbox)
//! - Run configuration loading
//! - Dataset loading and task selection
//! - Batch artifacts and orchestration

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: set OPENROUTER_API_KEY or LITELLM_API_KEY, pass --api-key, or point --api-base at a keyless endpoint")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Scripted responses exhausted after {calls} calls")]
    ScriptExhausted { calls: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LlmError {
    /// Whether the failure is transient and worth another attempt.
    ///
    /// Transport failures, rate limits, request timeouts and server errors
    /// are retried; authentication, malformed requests and parse failures
    /// are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RequestFailed(_) | LlmError::RateLimited(_) => true,
            LlmError::ApiError { code, .. } => *code >= 500 || *code == 429 || *code == 408,
            _ => false,
        }
    }
}

/// Errors raised by execution environments.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// The command exceeded its time budget. Output produced before the
    /// kill is preserved.
    #[error("Command timed out after {seconds} seconds")]
    Timeout { seconds: u64, partial_output: String },

    #[error("Environment setup failed: {0}")]
    SetupFailed(String),

    #[error("Startup command exited with code {code}: {output}")]
    StartupFailed { code: i32, output: String },

    #[error("Command execution failed: {0}")]
    ExecFailed(String),

    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to pull image '{image}': {reason}")]
    ImagePullFailed { image: String, reason: String },

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Environment is not set up")]
    NotReady,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvironmentError {
    /// Whether this error means the backend could not be provisioned.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            EnvironmentError::SetupFailed(_)
                | EnvironmentError::StartupFailed { .. }
                | EnvironmentError::DaemonUnavailable(_)
                | EnvironmentError::ImagePullFailed { .. }
                | EnvironmentError::NotReady
        )
    }
}

/// Errors that can occur while loading run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration value for '{field}': {message}")]
    Invalid { field: String, message: String },
}

/// Errors that can occur while loading or selecting tasks.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Unsupported dataset format '{0}': expected .json, .jsonl, .yaml or .yml")]
    UnsupportedFormat(String),

    #[error("Invalid task record at {location}: {message}")]
    InvalidRecord { location: String, message: String },

    #[error("Duplicate task id '{0}'")]
    DuplicateId(String),

    #[error("Invalid filter pattern '{pattern}': {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid slice specification '{0}': expected 'stop', 'start:stop' or 'start:stop:step'")]
    InvalidSlice(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors reading or writing batch output files.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt '{path}': {message}")]
    Corrupt { path: String, message: String },

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Task id '{0}' cannot be stored under the output directory")]
    InvalidTaskId(String),

    #[error("Artifact writer stopped: {0}")]
    Interrupted(String),
}

/// Errors that abort a whole batch. Per-task failures never do.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("Worker {worker} failed: {message}")]
    WorkerFailed { worker: usize, message: String },
}
