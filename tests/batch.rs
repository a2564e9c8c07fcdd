//! Batch harness tests with stub environments and a scripted model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use swe_runner::batch::artifacts::{HISTOGRAM_FILE, PREDICTIONS_FILE};
use swe_runner::batch::{BatchOrchestrator, StatusHistogram};
use swe_runner::execution::{EnvironmentFactory, Observation};
use swe_runner::llm::ScriptedProvider;
use swe_runner::runner::Transcript;
use swe_runner::{
    Cancellation, Environment, EnvironmentError, EnvironmentKind, RunConfig, RunContext, Task,
};

/// Counts provisioned environments and commands running at once.
#[derive(Default)]
struct Gauge {
    created: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

struct SlowEnv {
    gauge: Arc<Gauge>,
    delay: Duration,
}

#[async_trait]
impl Environment for SlowEnv {
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
        let now = self.gauge.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.gauge.running.fetch_sub(1, Ordering::SeqCst);
        Ok(Observation::new("TASK_COMPLETE\ndiff --git a/f b/f", 0))
    }

    async fn cleanup(&mut self) {}
}

struct SlowFactory {
    gauge: Arc<Gauge>,
    delay: Duration,
    /// Cancel the batch when this many environments have been created.
    cancel_at: Option<(usize, Cancellation)>,
}

impl SlowFactory {
    fn new(gauge: Arc<Gauge>, delay: Duration) -> Self {
        Self {
            gauge,
            delay,
            cancel_at: None,
        }
    }
}

impl EnvironmentFactory for SlowFactory {
    fn create(&self, _task: &Task) -> Result<Box<dyn Environment>, EnvironmentError> {
        let created = self.gauge.created.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, cancellation)) = &self.cancel_at {
            if created >= *at {
                cancellation.cancel();
            }
        }
        Ok(Box::new(SlowEnv {
            gauge: Arc::clone(&self.gauge),
            delay: self.delay,
        }))
    }
}

fn tasks(n: usize) -> Vec<Task> {
    (0..n)
        .map(|i| Task::new(format!("repo__issue-{i}"), "fix the bug"))
        .collect()
}

fn context(dir: &TempDir, workers: usize, factory: SlowFactory) -> RunContext {
    let mut config = RunConfig::new().with_workers(workers);
    config.batch.output_dir = dir.path().to_path_buf();
    config.batch.progress_interval_secs = 0;
    let provider = Arc::new(ScriptedProvider::repeating(
        "THOUGHT: done\n\n```bash\ngit diff\n```",
    ));
    RunContext::new(config, provider, Arc::new(factory))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bounded_concurrency() {
    let dir = TempDir::new().expect("tempdir");
    let gauge = Arc::new(Gauge::default());
    let ctx = context(
        &dir,
        3,
        SlowFactory::new(Arc::clone(&gauge), Duration::from_millis(40)),
    );

    let summary = BatchOrchestrator::new(ctx)
        .expect("orchestrator")
        .run(tasks(10))
        .await
        .expect("batch");

    assert_eq!(summary.total, 10);
    assert_eq!(summary.submitted(), 10);
    assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
    assert!(gauge.peak.load(Ordering::SeqCst) >= 1);
    assert_eq!(gauge.running.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_restart_skips_completed_tasks() {
    let dir = TempDir::new().expect("tempdir");

    let first_gauge = Arc::new(Gauge::default());
    let first = BatchOrchestrator::new(context(
        &dir,
        2,
        SlowFactory::new(Arc::clone(&first_gauge), Duration::ZERO),
    ))
    .expect("orchestrator")
    .run(tasks(4))
    .await
    .expect("first run");
    assert_eq!(first.submitted(), 4);
    assert_eq!(first_gauge.created.load(Ordering::SeqCst), 4);

    let second_gauge = Arc::new(Gauge::default());
    let second = BatchOrchestrator::new(context(
        &dir,
        2,
        SlowFactory::new(Arc::clone(&second_gauge), Duration::ZERO),
    ))
    .expect("orchestrator")
    .run(tasks(4))
    .await
    .expect("second run");

    assert_eq!(second.skipped, 4);
    assert_eq!(second.total, 0);
    assert_eq!(second_gauge.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_artifacts_layout() {
    let dir = TempDir::new().expect("tempdir");
    let ctx = context(
        &dir,
        2,
        SlowFactory::new(Arc::new(Gauge::default()), Duration::ZERO),
    );
    BatchOrchestrator::new(ctx)
        .expect("orchestrator")
        .run(tasks(2))
        .await
        .expect("batch");

    let predictions: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join(PREDICTIONS_FILE)).expect("predictions"),
    )
    .expect("json");
    assert_eq!(
        predictions["repo__issue-0"]["model_patch"],
        "diff --git a/f b/f"
    );
    assert_eq!(predictions["repo__issue-1"]["instance_id"], "repo__issue-1");

    let histogram: StatusHistogram = serde_yaml::from_str(
        &std::fs::read_to_string(dir.path().join(HISTOGRAM_FILE)).expect("histogram"),
    )
    .expect("yaml");
    assert_eq!(histogram["Submitted"], vec!["repo__issue-0", "repo__issue-1"]);

    let transcript = Transcript::load(&dir.path().join("repo__issue-0").join("transcript.json"))
        .expect("transcript");
    assert_eq!(transcript.info.exit_status, "Submitted");
    assert_eq!(transcript.info.model_stats.api_calls, 1);
    // system, instance, assistant
    assert_eq!(transcript.messages.len(), 3);
}

#[tokio::test]
async fn test_cancellation_stops_dequeuing_and_resumes() {
    let dir = TempDir::new().expect("tempdir");
    let cancellation = Cancellation::new();
    let gauge = Arc::new(Gauge::default());
    let factory = SlowFactory {
        gauge: Arc::clone(&gauge),
        delay: Duration::ZERO,
        cancel_at: Some((2, cancellation.clone())),
    };
    let ctx = context(&dir, 1, factory).with_cancellation(cancellation);

    let orchestrator = BatchOrchestrator::new(ctx).expect("orchestrator");
    let summary = orchestrator.run(tasks(5)).await.expect("batch");

    assert_eq!(summary.by_status.get("Submitted"), Some(&1));
    assert_eq!(summary.by_status.get("Cancelled"), Some(&1));
    assert_eq!(summary.not_started, 3);
    assert_eq!(gauge.created.load(Ordering::SeqCst), 2);

    let predictions = orchestrator.store().predictions().await.expect("predictions");
    assert_eq!(predictions.len(), 1);
    assert!(predictions.contains_key("repo__issue-0"));
    assert!(orchestrator
        .store()
        .transcript_path("repo__issue-1")
        .expect("path")
        .exists());

    let resumed = BatchOrchestrator::new(context(
        &dir,
        2,
        SlowFactory::new(Arc::new(Gauge::default()), Duration::ZERO),
    ))
    .expect("orchestrator")
    .run(tasks(5))
    .await
    .expect("resume");

    assert_eq!(resumed.skipped, 1);
    assert_eq!(resumed.submitted(), 4);
}

#[tokio::test]
async fn test_failing_environment_does_not_abort_batch() {
    struct Broken;

    impl EnvironmentFactory for Broken {
        fn create(&self, task: &Task) -> Result<Box<dyn Environment>, EnvironmentError> {
            Err(EnvironmentError::ImagePullFailed {
                image: format!("img-{}", task.id),
                reason: "not found".to_string(),
            })
        }
    }

    let dir = TempDir::new().expect("tempdir");
    let mut config = RunConfig::new().with_workers(2);
    config.batch.output_dir = dir.path().to_path_buf();
    config.batch.progress_interval_secs = 0;
    let provider = Arc::new(ScriptedProvider::repeating("```bash\nls\n```"));
    let ctx = RunContext::new(config, provider.clone(), Arc::new(Broken));

    let summary = BatchOrchestrator::new(ctx)
        .expect("orchestrator")
        .run(tasks(3))
        .await
        .expect("batch");

    assert_eq!(summary.by_status.get("EnvironmentSetupError"), Some(&3));
    assert_eq!(provider.attempts(), 0);
}
