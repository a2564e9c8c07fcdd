//! Task records and dataset loading.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::error::DatasetError;

/// One independent unit of work for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    #[serde(alias = "instance_id")]
    pub id: String,
    /// Natural-language description of the work.
    #[serde(alias = "problem_statement")]
    pub instruction: String,
    /// Container image reference for the container backend.
    #[serde(
        default,
        alias = "image_name",
        alias = "docker_image",
        skip_serializing_if = "Option::is_none"
    )]
    pub environment_spec: Option<String>,
    /// Command run once after the environment is provisioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_command: Option<String>,
    /// Any other dataset fields; exposed to prompt templates.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Task {
    pub fn new(id: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instruction: instruction.into(),
            environment_spec: None,
            startup_command: None,
            extra: BTreeMap::new(),
        }
    }

    /// A task for an ad-hoc instruction with a generated id.
    pub fn adhoc(instruction: impl Into<String>) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self::new(format!("adhoc-{}", &id[..8]), instruction)
    }

    pub fn with_environment_spec(mut self, image: impl Into<String>) -> Self {
        self.environment_spec = Some(image.into());
        self
    }

    pub fn with_startup_command(mut self, command: impl Into<String>) -> Self {
        self.startup_command = Some(command.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Load tasks from a `.json` array, a `.jsonl` file or a `.yaml` sequence.
///
/// Every record needs a non-empty id and instruction; ids must be unique.
pub fn load_tasks(path: &Path) -> Result<Vec<Task>, DatasetError> {
    let content = std::fs::read_to_string(path)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();

    let tasks: Vec<Task> = match extension.as_str() {
        "json" => serde_json::from_str(&content)?,
        "jsonl" => parse_jsonl(&content)?,
        "yaml" | "yml" => serde_yaml::from_str(&content)?,
        other => return Err(DatasetError::UnsupportedFormat(other.to_string())),
    };

    validate(&tasks)?;
    tracing::info!(path = %path.display(), tasks = tasks.len(), "Loaded dataset");
    Ok(tasks)
}

fn parse_jsonl(content: &str) -> Result<Vec<Task>, DatasetError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|e| DatasetError::InvalidRecord {
                location: format!("line {}", index + 1),
                message: e.to_string(),
            })
        })
        .collect()
}

/// Why `id` cannot name a task, if it cannot. Ids become directory and
/// container names, so the path-like `.` and `..` are refused.
pub fn invalid_id_reason(id: &str) -> Option<&'static str> {
    match id.trim() {
        "" => Some("empty id"),
        "." | ".." => Some("'.' and '..' are not valid ids"),
        _ => None,
    }
}

fn validate(tasks: &[Task]) -> Result<(), DatasetError> {
    let mut seen = HashSet::new();
    for (index, task) in tasks.iter().enumerate() {
        if let Some(reason) = invalid_id_reason(&task.id) {
            return Err(DatasetError::InvalidRecord {
                location: format!("record {}", index),
                message: reason.to_string(),
            });
        }
        if task.instruction.trim().is_empty() {
            return Err(DatasetError::InvalidRecord {
                location: format!("task '{}'", task.id),
                message: "empty instruction".to_string(),
            });
        }
        if !seen.insert(task.id.as_str()) {
            return Err(DatasetError::DuplicateId(task.id.clone()));
        }
    }
    Ok(())
}
