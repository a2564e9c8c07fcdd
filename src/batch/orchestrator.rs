//! Bounded worker pool over a task queue.
//!
//! A producer feeds tasks into an `mpsc` channel with capacity equal to the
//! worker count; `W` workers share the receiver and each drives one task at
//! a time. Cancellation stops the producer and keeps workers from taking
//! new tasks. Loops already running stop before their next model call.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::artifacts::ArtifactStore;
use super::progress::{BatchProgress, ProgressMonitor};
use super::selection::select_tasks;
use super::{BatchConfig, BatchSummary};
use crate::agent::StepObserver;
use crate::error::BatchError;
use crate::runner::{run_task, RunContext};
use crate::task::{load_tasks, Task};

/// What one worker did before the queue closed.
#[derive(Debug, Default)]
struct WorkerTally {
    by_status: BTreeMap<String, usize>,
    cost: f64,
    persist_failures: usize,
    not_started: usize,
}

/// Runs tasks through a fixed-size pool and persists every result.
pub struct BatchOrchestrator {
    ctx: RunContext,
    config: BatchConfig,
    store: Arc<ArtifactStore>,
}

impl BatchOrchestrator {
    /// Uses `ctx.config.batch` for pool size, output directory and selection.
    pub fn new(ctx: RunContext) -> Result<Self, BatchError> {
        let config = ctx.config.batch.clone();
        let store = ArtifactStore::open(&config.output_dir)?;
        Ok(Self {
            ctx,
            config,
            store: Arc::new(store),
        })
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Loads a dataset file and runs the selected tasks.
    pub async fn run_dataset(&self, path: &Path) -> Result<BatchSummary, BatchError> {
        let tasks = load_tasks(path)?;
        info!(path = %path.display(), tasks = tasks.len(), "Loaded dataset");
        self.run(tasks).await
    }

    /// Applies task selection, skipping tasks that already have a
    /// prediction, then runs the rest.
    pub async fn run(&self, tasks: Vec<Task>) -> Result<BatchSummary, BatchError> {
        let completed = self.store.completed_ids().await?;
        let selection = select_tasks(tasks, &self.config.selection, &completed)?;
        let mut summary = self.submit(selection.tasks).await?;
        summary.skipped = selection.skipped;
        Ok(summary)
    }

    /// Runs exactly `tasks` with `config.workers` workers.
    pub async fn submit(&self, tasks: Vec<Task>) -> Result<BatchSummary, BatchError> {
        let started = Instant::now();
        let total = tasks.len();
        let workers = self.config.workers.max(1).min(total.max(1));

        info!(
            tasks = total,
            workers = workers,
            output_dir = %self.store.output_dir().display(),
            "Starting batch"
        );

        let progress = Arc::new(BatchProgress::new(total));
        let monitor = self
            .config
            .progress_interval()
            .map(|interval| ProgressMonitor::start(Arc::clone(&progress), interval));

        let (tx, rx) = mpsc::channel::<Task>(workers);
        let rx = Arc::new(Mutex::new(rx));

        let cancellation = self.ctx.cancellation.clone();
        let producer = tokio::spawn(async move {
            let mut sent = 0usize;
            for task in tasks {
                if cancellation.is_cancelled() {
                    break;
                }
                if tx.send(task).await.is_err() {
                    break;
                }
                sent += 1;
            }
            total - sent
        });

        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let ctx = self.ctx.clone();
                let store = Arc::clone(&self.store);
                let progress = Arc::clone(&progress);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move { run_worker(worker, ctx, store, progress, rx).await })
            })
            .collect();
        drop(rx);

        let results = futures::future::join_all(handles).await;

        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        let mut summary = BatchSummary {
            total,
            ..Default::default()
        };
        let mut failure = None;
        for (worker, result) in results.into_iter().enumerate() {
            match result {
                Ok(tally) => {
                    for (status, count) in tally.by_status {
                        *summary.by_status.entry(status).or_default() += count;
                    }
                    summary.total_cost += tally.cost;
                    summary.persist_failures += tally.persist_failures;
                    summary.not_started += tally.not_started;
                }
                Err(e) => {
                    error!(worker = worker, error = %e, "Worker task failed");
                    failure.get_or_insert(BatchError::WorkerFailed {
                        worker,
                        message: e.to_string(),
                    });
                }
            }
        }

        match producer.await {
            Ok(unsent) => summary.not_started += unsent,
            Err(e) => {
                failure.get_or_insert(BatchError::WorkerFailed {
                    worker: workers,
                    message: format!("producer: {e}"),
                });
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }

        summary.elapsed = started.elapsed();
        info!(
            completed = summary.completed(),
            total = summary.total,
            not_started = summary.not_started,
            cost = format!("{:.4}", summary.total_cost),
            elapsed_secs = summary.elapsed.as_secs(),
            "Batch finished"
        );
        Ok(summary)
    }
}

async fn run_worker(
    worker: usize,
    ctx: RunContext,
    store: Arc<ArtifactStore>,
    progress: Arc<BatchProgress>,
    rx: Arc<Mutex<mpsc::Receiver<Task>>>,
) -> WorkerTally {
    let mut tally = WorkerTally::default();
    let observer: Arc<dyn StepObserver> = progress.clone();

    loop {
        let next = rx.lock().await.recv().await;
        let Some(task) = next else {
            break;
        };
        if ctx.cancellation.is_cancelled() {
            debug!(worker = worker, task_id = %task.id, "Cancelled before start");
            tally.not_started += 1;
            continue;
        }

        info!(worker = worker, task_id = %task.id, "Starting task");
        progress.task_started(&task.id);

        if let Err(e) = store.clear_task(&task.id).await {
            warn!(task_id = %task.id, error = %e, "Failed to clear stale artifacts");
        }

        let result = run_task(&ctx, &task, Some(Arc::clone(&observer))).await;
        if result.is_success() {
            info!(task_id = %task.id, calls = result.n_calls, cost = result.cost, "Task submitted");
        } else {
            warn!(
                task_id = %task.id,
                status = result.status_label(),
                calls = result.n_calls,
                "Task finished without submission"
            );
        }

        if let Err(e) = store.record(&result).await {
            error!(task_id = %task.id, error = %e, "Failed to persist task result");
            tally.persist_failures += 1;
        }

        progress.task_finished(&task.id, result.status_label(), result.cost);
        *tally
            .by_status
            .entry(result.status_label().to_string())
            .or_default() += 1;
        tally.cost += result.cost;
    }

    debug!(worker = worker, "Worker finished");
    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EnvironmentError;
    use crate::execution::{Environment, EnvironmentFactory, EnvironmentKind, Observation};
    use crate::llm::ScriptedProvider;
    use crate::runner::RunConfig;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct EchoEnv;

    #[async_trait]
    impl Environment for EchoEnv {
        fn kind(&self) -> EnvironmentKind {
            EnvironmentKind::Local
        }

        fn cwd(&self) -> String {
            "/work".to_string()
        }

        async fn setup(&mut self) -> Result<(), EnvironmentError> {
            Ok(())
        }

        async fn execute(
            &mut self,
            _command: &str,
            _cwd: Option<&str>,
            _timeout: Option<Duration>,
        ) -> Result<Observation, EnvironmentError> {
            Ok(Observation::new("TASK_COMPLETE\npatch", 0))
        }

        async fn cleanup(&mut self) {}
    }

    struct EchoFactory;

    impl EnvironmentFactory for EchoFactory {
        fn create(&self, _task: &Task) -> Result<Box<dyn Environment>, EnvironmentError> {
            Ok(Box::new(EchoEnv))
        }
    }

    fn orchestrator(dir: &TempDir, workers: usize) -> BatchOrchestrator {
        let mut config = RunConfig::new().with_workers(workers);
        config.batch.output_dir = dir.path().to_path_buf();
        config.batch.progress_interval_secs = 0;
        let provider = Arc::new(ScriptedProvider::repeating("```bash\necho hi\n```"));
        let ctx = RunContext::new(config, provider, Arc::new(EchoFactory));
        BatchOrchestrator::new(ctx).expect("orchestrator")
    }

    fn tasks(n: usize) -> Vec<Task> {
        (0..n).map(|i| Task::new(format!("t-{i}"), "fix")).collect()
    }

    #[tokio::test]
    async fn test_submit_runs_every_task() {
        let dir = TempDir::new().expect("tempdir");
        let summary = orchestrator(&dir, 2).submit(tasks(5)).await.expect("batch");

        assert_eq!(summary.total, 5);
        assert_eq!(summary.submitted(), 5);
        assert_eq!(summary.not_started, 0);
        assert_eq!(summary.persist_failures, 0);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let dir = TempDir::new().expect("tempdir");
        let summary = orchestrator(&dir, 4).submit(Vec::new()).await.expect("batch");
        assert_eq!(summary.total, 0);
        assert_eq!(summary.completed(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let orchestrator = orchestrator(&dir, 2);
        orchestrator.ctx.cancellation.cancel();

        let summary = orchestrator.submit(tasks(4)).await.expect("batch");

        assert_eq!(summary.completed(), 0);
        assert_eq!(summary.not_started, 4);
        assert!(orchestrator
            .store()
            .predictions()
            .await
            .expect("predictions")
            .is_empty());
    }

    #[tokio::test]
    async fn test_run_skips_completed() {
        let dir = TempDir::new().expect("tempdir");
        let orchestrator = orchestrator(&dir, 2);

        let first = orchestrator.run(tasks(3)).await.expect("first");
        assert_eq!(first.submitted(), 3);

        let second = orchestrator.run(tasks(4)).await.expect("second");
        assert_eq!(second.skipped, 3);
        assert_eq!(second.total, 1);
        assert_eq!(
            orchestrator.store().predictions().await.expect("p").len(),
            4
        );
    }
}
