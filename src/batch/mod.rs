//! Batch harness.
//!
//! Runs many tasks with a bounded worker pool and keeps the output
//! directory resumable:
//!
//! ```text
//! dataset → select_tasks → queue → N workers → run_task → ArtifactStore
//!                                        ↘ BatchProgress ← ProgressMonitor
//! ```
//!
//! A task that already has a prediction is skipped on the next run unless
//! `redo_existing` is set. Per-task failures are recorded as results and
//! never stop the batch.

pub mod artifacts;
pub mod orchestrator;
pub mod progress;
pub mod selection;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use artifacts::{ArtifactStore, Prediction, Predictions, StatusHistogram};
pub use orchestrator::BatchOrchestrator;
pub use progress::{BatchProgress, ProgressMonitor, ProgressSnapshot};
pub use selection::{select_tasks, Selection, SliceSpec, TaskSelection};

/// Batch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Tasks running at the same time.
    pub workers: usize,
    pub output_dir: PathBuf,
    /// Seconds between progress log lines; 0 disables them.
    pub progress_interval_secs: u64,
    #[serde(flatten)]
    pub selection: TaskSelection,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            output_dir: PathBuf::from("./runs"),
            progress_interval_secs: 30,
            selection: TaskSelection::default(),
        }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn with_selection(mut self, selection: TaskSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn progress_interval(&self) -> Option<Duration> {
        (self.progress_interval_secs > 0).then(|| Duration::from_secs(self.progress_interval_secs))
    }
}

/// Outcome of one batch invocation.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    /// Tasks handed to workers.
    pub total: usize,
    /// Tasks skipped because they already had a prediction.
    pub skipped: usize,
    /// Tasks never started because the batch was cancelled.
    pub not_started: usize,
    pub by_status: BTreeMap<String, usize>,
    pub total_cost: f64,
    /// Results whose artifacts could not be written.
    pub persist_failures: usize,
    pub elapsed: Duration,
}

impl BatchSummary {
    pub fn completed(&self) -> usize {
        self.by_status.values().sum()
    }

    pub fn submitted(&self) -> usize {
        self.by_status.get("Submitted").copied().unwrap_or(0)
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Batch finished: {} of {} tasks completed in {:.1}s ({} skipped, {} not started)",
            self.completed(),
            self.total,
            self.elapsed.as_secs_f64(),
            self.skipped,
            self.not_started
        )?;
        for (status, count) in &self.by_status {
            writeln!(f, "  {status}: {count}")?;
        }
        write!(f, "  total cost: ${:.4}", self.total_cost)?;
        if self.persist_failures > 0 {
            write!(f, "\n  artifact write failures: {}", self.persist_failures)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_config_yaml_flattens_selection() {
        let config: BatchConfig = serde_yaml::from_str(
            "workers: 8\noutput_dir: /tmp/out\nfilter: django\nslice: '0:10'\nredo_existing: true\n",
        )
        .expect("parse");

        assert_eq!(config.workers, 8);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.selection.filter.as_deref(), Some("django"));
        assert_eq!(config.selection.slice.as_deref(), Some("0:10"));
        assert!(config.selection.redo_existing);
        assert_eq!(config.progress_interval_secs, 30);
    }

    #[test]
    fn test_progress_interval_disabled_at_zero() {
        let mut config = BatchConfig::new();
        assert_eq!(config.progress_interval(), Some(Duration::from_secs(30)));
        config.progress_interval_secs = 0;
        assert_eq!(config.progress_interval(), None);
    }

    #[test]
    fn test_summary_display() {
        let mut summary = BatchSummary {
            total: 3,
            skipped: 2,
            total_cost: 0.5,
            ..Default::default()
        };
        summary.by_status.insert("Submitted".to_string(), 2);
        summary.by_status.insert("LimitsExceeded".to_string(), 1);

        let text = summary.to_string();
        assert!(text.contains("3 of 3 tasks completed"));
        assert!(text.contains("Submitted: 2"));
        assert!(text.contains("$0.5000"));
        assert_eq!(summary.submitted(), 2);
    }
}
