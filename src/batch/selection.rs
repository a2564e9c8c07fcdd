//! Choosing which dataset tasks a batch runs.
//!
//! Applied in this order:
//! 1. optional seeded shuffle (tasks are sorted by id first, so the order
//!    does not depend on the dataset file layout)
//! 2. id filter, a regex matched at the start of the id
//! 3. `stop`, `start:stop` or `start:stop:step` slice with Python semantics
//! 4. tasks already recorded in the predictions map are skipped

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::DatasetError;
use crate::task::Task;

/// Task selection options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSelection {
    pub shuffle_seed: Option<u64>,
    pub filter: Option<String>,
    pub slice: Option<String>,
    /// Re-run tasks that already have a prediction.
    pub redo_existing: bool,
}

/// Parsed slice. Negative bounds count from the end, as in Python.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceSpec {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl SliceSpec {
    /// Accepts `stop`, `start:stop` and `start:stop:step`; any part may be
    /// empty. A lone number keeps the first `stop` items.
    pub fn parse(spec: &str) -> Result<Self, DatasetError> {
        let invalid = || DatasetError::InvalidSlice(spec.to_string());
        let bound = |s: &str| -> Result<Option<i64>, DatasetError> {
            let s = s.trim();
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse().map(Some).map_err(|_| invalid())
            }
        };

        let parts: Vec<&str> = spec.trim().split(':').collect();
        let slice = match parts.as_slice() {
            [stop] => Self {
                start: None,
                stop: bound(stop)?,
                step: None,
            },
            [start, stop] => Self {
                start: bound(start)?,
                stop: bound(stop)?,
                step: None,
            },
            [start, stop, step] => Self {
                start: bound(start)?,
                stop: bound(stop)?,
                step: bound(step)?,
            },
            _ => return Err(invalid()),
        };
        if slice.step == Some(0) {
            return Err(invalid());
        }
        Ok(slice)
    }

    /// Indices this slice selects from a sequence of `len` items, in order.
    pub fn indices(&self, len: usize) -> Vec<usize> {
        let len = len as i64;
        let step = self.step.unwrap_or(1);
        let (lower, upper) = if step > 0 { (0, len) } else { (-1, len - 1) };
        let clamp = |bound: Option<i64>, default: i64| -> i64 {
            match bound {
                None => default,
                Some(i) if i < 0 => (i + len).max(lower),
                Some(i) => i.min(upper),
            }
        };

        let (start, stop) = if step > 0 {
            (clamp(self.start, lower), clamp(self.stop, upper))
        } else {
            (clamp(self.start, upper), clamp(self.stop, lower))
        };

        let mut picked = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            picked.push(i as usize);
            i += step;
        }
        picked
    }
}

/// Tasks chosen for a run.
#[derive(Debug, Clone)]
pub struct Selection {
    pub tasks: Vec<Task>,
    /// Tasks dropped because they already have a prediction.
    pub skipped: usize,
}

/// Applies shuffle, filter, slice and skip-existing to `tasks`.
pub fn select_tasks(
    mut tasks: Vec<Task>,
    options: &TaskSelection,
    completed: &HashSet<String>,
) -> Result<Selection, DatasetError> {
    if let Some(seed) = options.shuffle_seed {
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        tasks.shuffle(&mut rng);
    }

    if let Some(pattern) = options.filter.as_deref().filter(|p| !p.is_empty()) {
        let regex =
            Regex::new(&format!("^(?:{pattern})")).map_err(|source| DatasetError::InvalidFilter {
                pattern: pattern.to_string(),
                source,
            })?;
        tasks.retain(|t| regex.is_match(&t.id));
    }

    if let Some(spec) = options.slice.as_deref().filter(|s| !s.is_empty()) {
        let picked = SliceSpec::parse(spec)?.indices(tasks.len());
        let mut slots: Vec<Option<Task>> = tasks.into_iter().map(Some).collect();
        tasks = picked.into_iter().filter_map(|i| slots[i].take()).collect();
    }

    let mut skipped = 0;
    if !options.redo_existing {
        let before = tasks.len();
        tasks.retain(|t| !completed.contains(&t.id));
        skipped = before - tasks.len();
    }

    tracing::info!(selected = tasks.len(), skipped = skipped, "Selected tasks");
    Ok(Selection { tasks, skipped })
}
