//! Files a batch leaves in its output directory.
//!
//! ```text
//! output_dir/
//! ├── predictions.json          task_id → prediction
//! ├── status_histogram.yaml     status  → [task_id]
//! └── <encoded task_id>/transcript.json
//! ```
//!
//! Transcripts are written by the worker that owns the task. The two
//! shared files are only touched under one async lock, with a
//! read-modify-write of the whole file each time. File IO runs on the
//! blocking pool so a slow disk never parks a runtime thread.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::agent::ExitStatus;
use crate::error::ArtifactError;
use crate::runner::{write_atomic, ExecutionResult};

pub const PREDICTIONS_FILE: &str = "predictions.json";
pub const HISTOGRAM_FILE: &str = "status_histogram.yaml";
pub const TRANSCRIPT_FILE: &str = "transcript.json";

/// One entry of `predictions.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub instance_id: String,
    pub model_name_or_path: String,
    pub model_patch: String,
    pub exit_status: String,
}

impl Prediction {
    pub fn from_result(result: &ExecutionResult) -> Self {
        Self {
            instance_id: result.task_id.clone(),
            model_name_or_path: result.model_name.clone(),
            model_patch: result.result.clone(),
            exit_status: result.status_label().to_string(),
        }
    }
}

pub type Predictions = BTreeMap<String, Prediction>;
pub type StatusHistogram = BTreeMap<String, Vec<String>>;

/// Maps a task id onto one directory name.
///
/// `%`, path separators and control characters are percent-escaped, as is
/// a leading `.`, so distinct ids never share a directory and no id can
/// name `.`, `..` or a hidden entry.
pub fn encode_task_id(task_id: &str) -> String {
    let mut out = String::with_capacity(task_id.len());
    for (index, c) in task_id.char_indices() {
        let escape =
            matches!(c, '%' | '/' | '\\') || c.is_control() || (index == 0 && c == '.');
        if escape {
            let mut utf8 = [0u8; 4];
            for byte in c.encode_utf8(&mut utf8).bytes() {
                let _ = write!(out, "%{byte:02X}");
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Paths of the two files every worker updates.
#[derive(Debug, Clone)]
struct SharedFiles {
    predictions: PathBuf,
    histogram: PathBuf,
}

impl SharedFiles {
    fn read_predictions(&self) -> Result<Predictions, ArtifactError> {
        match std::fs::read_to_string(&self.predictions) {
            Ok(content) if content.trim().is_empty() => Ok(Predictions::new()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| ArtifactError::Corrupt {
                path: self.predictions.display().to_string(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Predictions::new()),
            Err(source) => Err(io_error(&self.predictions, source)),
        }
    }

    fn write_predictions(&self, predictions: &Predictions) -> Result<(), ArtifactError> {
        let json = serde_json::to_vec_pretty(predictions)
            .map_err(|e| ArtifactError::Serialize(e.to_string()))?;
        write_atomic(&self.predictions, &json).map_err(|source| io_error(&self.predictions, source))
    }

    fn read_histogram(&self) -> Result<StatusHistogram, ArtifactError> {
        match std::fs::read_to_string(&self.histogram) {
            Ok(content) if content.trim().is_empty() => Ok(StatusHistogram::new()),
            Ok(content) => serde_yaml::from_str(&content).map_err(|e| ArtifactError::Corrupt {
                path: self.histogram.display().to_string(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StatusHistogram::new()),
            Err(source) => Err(io_error(&self.histogram, source)),
        }
    }

    fn write_histogram(&self, histogram: &StatusHistogram) -> Result<(), ArtifactError> {
        let yaml =
            serde_yaml::to_string(histogram).map_err(|e| ArtifactError::Serialize(e.to_string()))?;
        write_atomic(&self.histogram, yaml.as_bytes())
            .map_err(|source| io_error(&self.histogram, source))
    }

    fn forget(&self, task_id: &str) -> Result<(), ArtifactError> {
        let mut predictions = self.read_predictions()?;
        if predictions.remove(task_id).is_some() {
            self.write_predictions(&predictions)?;
        }
        let mut histogram = self.read_histogram()?;
        if remove_from_histogram(&mut histogram, task_id) {
            self.write_histogram(&histogram)?;
        }
        Ok(())
    }

    fn store(
        &self,
        task_id: &str,
        label: &str,
        prediction: Option<Prediction>,
    ) -> Result<(), ArtifactError> {
        let mut predictions = self.read_predictions()?;
        match prediction {
            Some(prediction) => {
                predictions.insert(task_id.to_string(), prediction);
            }
            None => {
                predictions.remove(task_id);
            }
        }
        self.write_predictions(&predictions)?;

        let mut histogram = self.read_histogram()?;
        remove_from_histogram(&mut histogram, task_id);
        let ids = histogram.entry(label.to_string()).or_default();
        ids.push(task_id.to_string());
        ids.sort();
        self.write_histogram(&histogram)
    }
}

/// Reader and writer for one output directory.
pub struct ArtifactStore {
    output_dir: PathBuf,
    files: SharedFiles,
    lock: Mutex<()>,
}

impl ArtifactStore {
    pub fn open(output_dir: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir).map_err(|source| io_error(&output_dir, source))?;
        Ok(Self::at(output_dir))
    }

    fn at(output_dir: PathBuf) -> Self {
        Self {
            files: SharedFiles {
                predictions: output_dir.join(PREDICTIONS_FILE),
                histogram: output_dir.join(HISTOGRAM_FILE),
            },
            output_dir,
            lock: Mutex::new(()),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Directory holding this task's files, always one level below the
    /// output directory.
    pub fn task_dir(&self, task_id: &str) -> Result<PathBuf, ArtifactError> {
        let name = encode_task_id(task_id);
        let mut components = Path::new(&name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) if part.to_str() == Some(name.as_str()) => {
                Ok(self.output_dir.join(part))
            }
            _ => Err(ArtifactError::InvalidTaskId(task_id.to_string())),
        }
    }

    pub fn transcript_path(&self, task_id: &str) -> Result<PathBuf, ArtifactError> {
        Ok(self.task_dir(task_id)?.join(TRANSCRIPT_FILE))
    }

    pub async fn predictions(&self) -> Result<Predictions, ArtifactError> {
        let _guard = self.lock.lock().await;
        let files = self.files.clone();
        blocking(move || files.read_predictions()).await
    }

    /// Ids with a recorded prediction.
    pub async fn completed_ids(&self) -> Result<HashSet<String>, ArtifactError> {
        Ok(self.predictions().await?.into_keys().collect())
    }

    pub async fn histogram(&self) -> Result<StatusHistogram, ArtifactError> {
        let _guard = self.lock.lock().await;
        let files = self.files.clone();
        blocking(move || files.read_histogram()).await
    }

    /// Removes leftovers of an earlier attempt at this task.
    pub async fn clear_task(&self, task_id: &str) -> Result<(), ArtifactError> {
        let dir = self.task_dir(task_id)?;
        let removed = blocking(move || match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(io_error(&dir, source)),
        })
        .await?;
        if removed {
            debug!(task_id = task_id, "Removed stale task artifacts");
        }

        let _guard = self.lock.lock().await;
        let files = self.files.clone();
        let task_id = task_id.to_string();
        blocking(move || files.forget(&task_id)).await
    }

    /// Persists a finished task: transcript first, then the shared files.
    ///
    /// Cancelled tasks keep their transcript but get no prediction, so a
    /// later run picks them up again.
    pub async fn record(&self, result: &ExecutionResult) -> Result<(), ArtifactError> {
        let transcript = self.transcript_path(&result.task_id)?;
        let json = serde_json::to_vec_pretty(&result.to_transcript())
            .map_err(|e| ArtifactError::Serialize(e.to_string()))?;
        blocking(move || {
            write_atomic(&transcript, &json).map_err(|source| io_error(&transcript, source))
        })
        .await?;

        let prediction =
            (result.status != ExitStatus::Cancelled).then(|| Prediction::from_result(result));
        let task_id = result.task_id.clone();
        let label = result.status_label().to_string();

        let _guard = self.lock.lock().await;
        let files = self.files.clone();
        blocking(move || files.store(&task_id, &label, prediction)).await
    }
}

async fn blocking<T, F>(work: F) -> Result<T, ArtifactError>
where
    F: FnOnce() -> Result<T, ArtifactError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ArtifactError::Interrupted(e.to_string()))?
}

fn remove_from_histogram(histogram: &mut StatusHistogram, task_id: &str) -> bool {
    let mut changed = false;
    for ids in histogram.values_mut() {
        let before = ids.len();
        ids.retain(|id| id != task_id);
        changed |= ids.len() != before;
    }
    histogram.retain(|_, ids| !ids.is_empty());
    changed
}

fn io_error(path: &Path, source: std::io::Error) -> ArtifactError {
    ArtifactError::Io {
        path: path.display().to_string(),
        source,
    }
}
