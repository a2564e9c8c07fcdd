//! Live progress for batch runs.
//!
//! [`BatchProgress`] is shared by every worker and fed by the agent loops
//! through [`StepObserver`]. [`ProgressMonitor`] logs a snapshot of it on
//! a fixed interval.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::agent::StepObserver;

/// Step and cost of a task that is still running.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningTask {
    pub step: usize,
    pub cost: f64,
}

/// Point-in-time view of a batch.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub finished: usize,
    pub running: BTreeMap<String, RunningTask>,
    pub by_status: BTreeMap<String, usize>,
    pub cost: f64,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Finished tasks per minute.
    pub fn throughput(&self) -> f64 {
        let minutes = self.elapsed.as_secs_f64() / 60.0;
        if minutes > 0.0 {
            self.finished as f64 / minutes
        } else {
            0.0
        }
    }

    /// Estimated time until every task has finished.
    pub fn eta(&self) -> Option<Duration> {
        if self.finished == 0 {
            return None;
        }
        let remaining = self.total.saturating_sub(self.finished);
        let per_task = self.elapsed.as_secs_f64() / self.finished as f64;
        Some(Duration::from_secs_f64(per_task * remaining as f64))
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    running: BTreeMap<String, RunningTask>,
    by_status: BTreeMap<String, usize>,
    finished_cost: f64,
}

/// Shared progress counters for one batch.
#[derive(Debug)]
pub struct BatchProgress {
    total: usize,
    finished: AtomicUsize,
    state: Mutex<ProgressState>,
    start: Instant,
}

impl BatchProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            finished: AtomicUsize::new(0),
            state: Mutex::new(ProgressState::default()),
            start: Instant::now(),
        }
    }

    pub fn task_started(&self, task_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .running
                .insert(task_id.to_string(), RunningTask::default());
        }
    }

    pub fn task_finished(&self, task_id: &str, status: &str, cost: f64) {
        self.finished.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut state) = self.state.lock() {
            state.running.remove(task_id);
            *state.by_status.entry(status.to_string()).or_default() += 1;
            state.finished_cost += cost;
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let (running, by_status, cost) = match self.state.lock() {
            Ok(state) => {
                let live: f64 = state.running.values().map(|t| t.cost).sum();
                (
                    state.running.clone(),
                    state.by_status.clone(),
                    state.finished_cost + live,
                )
            }
            Err(_) => (BTreeMap::new(), BTreeMap::new(), 0.0),
        };
        ProgressSnapshot {
            total: self.total,
            finished: self.finished.load(Ordering::Relaxed),
            running,
            by_status,
            cost,
            elapsed: self.start.elapsed(),
        }
    }
}

impl StepObserver for BatchProgress {
    fn on_step(&self, task_id: &str, step: usize, cost: f64) {
        if let Ok(mut state) = self.state.lock() {
            state
                .running
                .insert(task_id.to_string(), RunningTask { step, cost });
        }
    }
}

/// Background task that periodically logs batch progress.
///
/// Call [`ProgressMonitor::stop`] to cancel; dropping it also stops the
/// task at its next tick.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    pub fn start(progress: Arc<BatchProgress>, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = progress.snapshot();
                let pct = if snap.total > 0 {
                    snap.finished as f64 / snap.total as f64 * 100.0
                } else {
                    0.0
                };
                let running: Vec<String> = snap
                    .running
                    .iter()
                    .map(|(id, t)| format!("{id}@{}", t.step))
                    .collect();

                tracing::info!(
                    finished = snap.finished,
                    total = snap.total,
                    progress_pct = format!("{:.1}%", pct),
                    running = running.len(),
                    running_tasks = %running.join(","),
                    statuses = ?snap.by_status,
                    cost = format!("{:.4}", snap.cost),
                    tasks_per_min = format!("{:.2}", snap.throughput()),
                    eta_secs = snap.eta().map(|d| d.as_secs()),
                    elapsed_secs = snap.elapsed.as_secs(),
                    "Batch progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the monitor to stop and wait for it.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}
