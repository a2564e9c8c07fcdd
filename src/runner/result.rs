//! Terminal task records and transcript persistence.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{AgentRun, ExitStatus};
use crate::llm::Message;

/// Format tag written into every transcript.
pub const TRAJECTORY_FORMAT: &str = "swe-runner-1";

/// Complete result of running one task. Created once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub model_name: String,
    pub status: ExitStatus,
    /// Submission text, or the reason the task stopped.
    pub result: String,
    pub messages: Vec<Message>,
    pub n_calls: usize,
    pub cost: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Resolved configuration the task ran with (without secrets).
    pub config: serde_json::Value,
}

impl ExecutionResult {
    pub fn from_run(
        task_id: impl Into<String>,
        model_name: impl Into<String>,
        run: AgentRun,
        started_at: DateTime<Utc>,
        config: serde_json::Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            model_name: model_name.into(),
            status: run.status,
            result: run.result,
            messages: run.messages,
            n_calls: run.n_calls,
            cost: run.cost,
            started_at,
            finished_at: Utc::now(),
            config,
        }
    }

    /// A task that failed before its loop could start.
    pub fn fatal(
        task_id: impl Into<String>,
        model_name: impl Into<String>,
        kind: &str,
        message: impl Into<String>,
        started_at: DateTime<Utc>,
        config: serde_json::Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            model_name: model_name.into(),
            status: ExitStatus::FatalError {
                kind: kind.to_string(),
            },
            result: message.into(),
            messages: Vec::new(),
            n_calls: 0,
            cost: 0.0,
            started_at,
            finished_at: Utc::now(),
            config,
        }
    }

    /// Histogram key for this result.
    pub fn status_label(&self) -> &str {
        self.status.label()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn to_transcript(&self) -> Transcript {
        Transcript {
            info: TranscriptInfo {
                instance_id: self.task_id.clone(),
                exit_status: self.status_label().to_string(),
                submission: self.result.clone(),
                model_stats: ModelStats {
                    api_calls: self.n_calls,
                    instance_cost: self.cost,
                },
                config: self.config.clone(),
                started_at: self.started_at,
                finished_at: self.finished_at,
            },
            messages: self.messages.clone(),
            trajectory_format: TRAJECTORY_FORMAT.to_string(),
        }
    }

    /// Atomically writes the transcript as pretty JSON.
    pub fn save_transcript(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(&self.to_transcript())?;
        write_atomic(path, &json)
    }
}

/// On-disk transcript of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub info: TranscriptInfo,
    pub messages: Vec<Message>,
    pub trajectory_format: String,
}

impl Transcript {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptInfo {
    pub instance_id: String,
    pub exit_status: String,
    pub submission: String,
    pub model_stats: ModelStats,
    pub config: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelStats {
    pub api_calls: usize,
    pub instance_cost: f64,
}

/// Writes `contents` to `path` through a temporary file in the same
/// directory, so readers never see a partial file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
