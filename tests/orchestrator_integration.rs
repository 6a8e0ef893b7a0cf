//! End-to-end orchestrator tests.
//!
//! Each test runs the real orchestrator (dispatch loop, collector loop,
//! timeout sweeper) against the in-memory broker and store, with scripted
//! worker tasks draining the dimension queues the way the external scoring
//! pools would.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use evalforge::broker::{names, Broker, InMemoryBroker};
use evalforge::enqueue::{EnqueueFacade, RequeueOutcome};
use evalforge::store::{InMemoryStore, Store};
use evalforge::{
    BatchStatus, Dimension, DimensionResult, DimensionTask, Orchestrator, OrchestratorConfig,
    RecordStatus, ResponseRecord,
};

/// Orchestrator timings tightened so tests settle in milliseconds.
fn quick_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_main_pop_timeout(Duration::from_millis(30))
        .with_results_pop_timeout(Duration::from_millis(30))
        .with_dispatch_backoff(Duration::from_millis(10))
        .with_sweep_interval(Duration::from_millis(100))
        .with_task_timeout(Duration::from_secs(30))
        .with_hard_shutdown_deadline(Duration::from_secs(2))
}

struct Harness {
    broker: Arc<InMemoryBroker>,
    store: Arc<InMemoryStore>,
    facade: EnqueueFacade,
    orchestrator: Orchestrator,
    workers: Vec<JoinHandle<()>>,
}

impl Harness {
    fn new(config: OrchestratorConfig) -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(InMemoryStore::new());
        let facade = EnqueueFacade::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&store) as Arc<dyn Store>,
            config.max_retries,
            config.progress_snapshot_ttl,
        );
        let orchestrator = Orchestrator::new(
            config,
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&store) as Arc<dyn Store>,
        )
        .expect("valid config");

        Self {
            broker,
            store,
            facade,
            orchestrator,
            workers: Vec::new(),
        }
    }

    /// Seeds a batch of records with the given agent ids.
    async fn seed_batch(&self, batch_id: &str, agents: &[&str]) -> Vec<ResponseRecord> {
        self.store
            .insert_batch(batch_id, agents.len() as u64)
            .await
            .expect("insert batch");

        let mut records = Vec::new();
        for (i, agent) in agents.iter().enumerate() {
            let record =
                ResponseRecord::new(format!("resp-{}", i), batch_id, *agent, "p", "answer text");
            self.store.insert_record(&record).await.expect("insert record");
            records.push(record);
        }
        records
    }

    /// Spawns a scripted worker pool for one dimension. Each popped subtask
    /// is answered `copies` times after `delay`, using `behavior` to decide
    /// the score and error.
    fn spawn_worker<F>(&mut self, dimension: Dimension, delay: Duration, copies: usize, behavior: F)
    where
        F: Fn(&DimensionTask) -> (f64, Option<String>) + Send + Sync + 'static,
    {
        let broker = Arc::clone(&self.broker);
        let handle = tokio::spawn(async move {
            let queue = names::dimension_queue(dimension);
            loop {
                match broker.pop_head(&queue).await {
                    Ok(Some(payload)) => {
                        let subtask: DimensionTask =
                            serde_json::from_str(&payload).expect("valid subtask");
                        if !delay.is_zero() {
                            sleep(delay).await;
                        }
                        let (score, error) = behavior(&subtask);
                        let result = DimensionResult {
                            task_id: subtask.task.task_id.clone(),
                            dimension,
                            response_id: subtask.task.response_id.clone(),
                            batch_id: subtask.task.batch_id.clone(),
                            agent_id: subtask.task.agent_id.clone(),
                            score,
                            details: serde_json::json!({}),
                            error,
                            processing_time_ms: 5,
                            worker_id: format!("{}-worker", dimension),
                        };
                        let payload = serde_json::to_string(&result).expect("serialize");
                        for _ in 0..copies {
                            broker
                                .append(names::RESULTS_QUEUE, &payload)
                                .await
                                .expect("append result");
                        }
                    }
                    Ok(None) => sleep(Duration::from_millis(5)).await,
                    Err(_) => break,
                }
            }
        });
        self.workers.push(handle);
    }

    /// Spawns well-behaved workers for all five dimensions returning a flat
    /// score.
    fn spawn_uniform_workers(&mut self, score: f64) {
        for dimension in Dimension::ALL {
            self.spawn_worker(dimension, Duration::ZERO, 1, move |_| (score, None));
        }
    }

    async fn start(&mut self) {
        self.orchestrator.start().await.expect("start");
    }

    /// Polls batch progress until it drains or the deadline passes.
    async fn wait_for_drained(&self, batch_id: &str, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let progress = self
                .store
                .get_batch_progress(batch_id)
                .await
                .expect("progress");
            if progress.total > 0 && progress.is_drained() {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "batch {} did not drain in time: {:?}",
                batch_id,
                progress
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn shutdown(mut self) {
        for worker in &self.workers {
            worker.abort();
        }
        let _ = self.orchestrator.stop().await;
    }
}

#[tokio::test]
async fn happy_path_batch_completes_with_uniform_scores() {
    let mut h = Harness::new(quick_config());
    let records = h.seed_batch("batch-1", &["a1", "a2", "a1"]).await;

    h.spawn_uniform_workers(0.8);
    h.start().await;

    h.facade
        .enqueue_batch("batch-1", &records)
        .await
        .expect("enqueue");

    h.wait_for_drained("batch-1", Duration::from_secs(5)).await;

    for record in &records {
        let loaded = h.store.get_record(&record.response_id).await.expect("get");
        assert_eq!(loaded.status, RecordStatus::Completed);

        let evaluation = h
            .store
            .get_evaluation(&record.response_id)
            .await
            .expect("get")
            .expect("evaluation written");
        assert!((evaluation.final_score - 0.8).abs() < 1e-9);
        assert_eq!(evaluation.scores.len(), 5);
        assert!(evaluation.scores.values().all(|s| (s - 0.8).abs() < 1e-9));
        assert!(evaluation.processing_errors.is_empty());
        assert_eq!(evaluation.agent_id, record.agent_id);
    }

    let progress = h.store.get_batch_progress("batch-1").await.expect("progress");
    assert_eq!(progress.total, 3);
    assert_eq!(progress.completed, 3);
    assert_eq!(progress.failed, 0);
    assert_eq!(
        h.store.get_batch_status("batch-1").await.expect("status"),
        BatchStatus::Completed
    );

    h.shutdown().await;
}

#[tokio::test]
async fn mixed_errors_renormalise_the_final_score() {
    let mut h = Harness::new(quick_config());
    let records = h.seed_batch("batch-1", &["a1"]).await;

    h.spawn_worker(Dimension::Instruction, Duration::ZERO, 1, |_| (0.9, None));
    h.spawn_worker(Dimension::Hallucination, Duration::ZERO, 1, |_| {
        (0.0, Some("nli timeout".to_string()))
    });
    h.spawn_worker(Dimension::Assumption, Duration::ZERO, 1, |_| (1.0, None));
    h.spawn_worker(Dimension::Coherence, Duration::ZERO, 1, |_| (0.6, None));
    h.spawn_worker(Dimension::Accuracy, Duration::ZERO, 1, |_| (0.8, None));
    h.start().await;

    h.facade
        .enqueue_batch("batch-1", &records)
        .await
        .expect("enqueue");
    h.wait_for_drained("batch-1", Duration::from_secs(5)).await;

    let record = h.store.get_record("resp-0").await.expect("get");
    assert_eq!(record.status, RecordStatus::Completed);

    let evaluation = h
        .store
        .get_evaluation("resp-0")
        .await
        .expect("get")
        .expect("evaluation written");

    // (0.20*0.9 + 0.20*1.0 + 0.15*0.6 + 0.20*0.8) / 0.75 = 0.84
    assert!((evaluation.final_score - 0.84).abs() < 1e-9);
    assert_eq!(evaluation.processing_errors.len(), 1);
    assert!(evaluation.processing_errors[0].contains("hallucination"));
    assert!(evaluation.processing_errors[0].contains("nli timeout"));
    assert_eq!(evaluation.scores[&Dimension::Hallucination], 0.0);

    h.shutdown().await;
}

#[tokio::test]
async fn missing_dimensions_time_out_and_fail_the_record() {
    let config = quick_config()
        .with_task_timeout(Duration::from_millis(300))
        .with_sweep_interval(Duration::from_millis(100));
    let mut h = Harness::new(config);
    let records = h.seed_batch("batch-1", &["a1"]).await;

    // Only three of five dimensions ever answer.
    for dimension in [
        Dimension::Instruction,
        Dimension::Assumption,
        Dimension::Coherence,
    ] {
        h.spawn_worker(dimension, Duration::ZERO, 1, |_| (0.9, None));
    }
    h.start().await;

    h.facade
        .enqueue_batch("batch-1", &records)
        .await
        .expect("enqueue");
    h.wait_for_drained("batch-1", Duration::from_secs(5)).await;

    let record = h.store.get_record("resp-0").await.expect("get");
    assert_eq!(record.status, RecordStatus::Failed);

    // No evaluation was written and the partial results are gone.
    assert!(h
        .store
        .get_evaluation("resp-0")
        .await
        .expect("get")
        .is_none());
    let leftovers = h
        .broker
        .scan_keys(names::PARTIAL_RESULTS_PATTERN)
        .await
        .expect("scan");
    assert!(leftovers.is_empty(), "partial results not cleaned up");

    let progress = h.store.get_batch_progress("batch-1").await.expect("progress");
    assert_eq!(progress.failed, 1);
    assert_eq!(progress.completed, 0);

    h.shutdown().await;
}

#[tokio::test]
async fn duplicate_deliveries_produce_one_evaluation() {
    let mut h = Harness::new(quick_config());
    let records = h.seed_batch("batch-1", &["a1"]).await;

    // Every dimension delivers its result twice.
    for dimension in Dimension::ALL {
        h.spawn_worker(dimension, Duration::ZERO, 2, |_| (0.8, None));
    }
    h.start().await;

    h.facade
        .enqueue_batch("batch-1", &records)
        .await
        .expect("enqueue");
    h.wait_for_drained("batch-1", Duration::from_secs(5)).await;

    // Give the collector time to chew through the duplicate deliveries.
    sleep(Duration::from_millis(200)).await;

    assert_eq!(h.store.evaluation_count(), 1);
    let evaluation = h
        .store
        .get_evaluation("resp-0")
        .await
        .expect("get")
        .expect("evaluation written");
    assert!((evaluation.final_score - 0.8).abs() < 1e-9);
    assert_eq!(
        h.store.get_record("resp-0").await.expect("get").status,
        RecordStatus::Completed
    );

    h.shutdown().await;
}

#[tokio::test]
async fn retry_exhausted_record_stays_failed() {
    let h = Harness::new(quick_config());
    let records = h.seed_batch("batch-1", &["a1"]).await;

    h.store
        .mark_record_status(&records[0].response_id, RecordStatus::Failed)
        .await
        .expect("mark");
    h.store
        .set_retry_count(&records[0].response_id, 3)
        .await
        .expect("set");

    let outcome = h
        .facade
        .requeue_failed(&records[0].response_id, "still failing")
        .await
        .expect("requeue");
    assert_eq!(outcome, RequeueOutcome::RetryExhausted);

    assert_eq!(
        h.broker.len(names::MAIN_QUEUE).await.expect("len"),
        0,
        "no task may be created past the retry ceiling"
    );
    let record = h.store.get_record("resp-0").await.expect("get");
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.retry_count, 3);

    h.shutdown().await;
}

#[tokio::test]
async fn concurrency_cap_bounds_processing_records() {
    let config = quick_config().with_max_concurrent_tasks(2);
    let mut h = Harness::new(config);
    let records = h.seed_batch("batch-1", &["a1", "a2", "a3", "a4", "a5"]).await;

    // Slow workers keep tasks in flight long enough to observe the cap.
    for dimension in Dimension::ALL {
        h.spawn_worker(dimension, Duration::from_millis(40), 1, |_| (0.7, None));
    }
    h.start().await;

    h.facade
        .enqueue_batch("batch-1", &records)
        .await
        .expect("enqueue");

    // Sample while the batch drains: never more than two records processing.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let progress = h
            .store
            .get_batch_progress("batch-1")
            .await
            .expect("progress");
        assert!(
            progress.processing <= 2,
            "cap violated: {} records processing",
            progress.processing
        );
        if progress.total > 0 && progress.is_drained() {
            break;
        }
        assert!(Instant::now() < deadline, "batch did not drain in time");
        sleep(Duration::from_millis(5)).await;
    }

    for record in &records {
        let evaluation = h
            .store
            .get_evaluation(&record.response_id)
            .await
            .expect("get")
            .expect("evaluation written");
        assert!((evaluation.final_score - 0.7).abs() < 1e-9);
    }
    assert_eq!(h.store.evaluation_count(), 5);

    h.shutdown().await;
}

#[tokio::test]
async fn all_dimensions_erroring_fails_the_record() {
    let mut h = Harness::new(quick_config());
    let records = h.seed_batch("batch-1", &["a1"]).await;

    for dimension in Dimension::ALL {
        h.spawn_worker(dimension, Duration::ZERO, 1, |_| {
            (0.0, Some("model crashed".to_string()))
        });
    }
    h.start().await;

    h.facade
        .enqueue_batch("batch-1", &records)
        .await
        .expect("enqueue");
    h.wait_for_drained("batch-1", Duration::from_secs(5)).await;

    // Completeness of the partial results alone does not imply success.
    let record = h.store.get_record("resp-0").await.expect("get");
    assert_eq!(record.status, RecordStatus::Failed);

    let evaluation = h
        .store
        .get_evaluation("resp-0")
        .await
        .expect("get")
        .expect("evaluation records what happened");
    assert_eq!(evaluation.final_score, 0.0);
    assert_eq!(evaluation.processing_errors.len(), 5);

    let progress = h.store.get_batch_progress("batch-1").await.expect("progress");
    assert_eq!(progress.failed, 1);

    h.shutdown().await;
}

#[tokio::test]
async fn cancelled_records_are_skipped_by_dispatch() {
    let mut h = Harness::new(quick_config());
    let records = h.seed_batch("batch-1", &["a1", "a2"]).await;

    h.spawn_uniform_workers(0.9);

    // Enqueue first, cancel before the orchestrator starts: both tasks sit
    // on the main queue but their records are already cancelled.
    h.facade
        .enqueue_batch("batch-1", &records)
        .await
        .expect("enqueue");
    h.facade.cancel_batch("batch-1").await.expect("cancel");

    h.start().await;

    // The dispatch loop drains the queue but drops both tasks.
    let deadline = Instant::now() + Duration::from_secs(5);
    while h.broker.len(names::MAIN_QUEUE).await.expect("len") > 0 {
        assert!(Instant::now() < deadline, "main queue did not drain");
        sleep(Duration::from_millis(10)).await;
    }
    sleep(Duration::from_millis(100)).await;

    for record in &records {
        assert_eq!(
            h.store.get_record(&record.response_id).await.expect("get").status,
            RecordStatus::Cancelled
        );
        assert!(h
            .store
            .get_evaluation(&record.response_id)
            .await
            .expect("get")
            .is_none());
    }
    assert_eq!(
        h.store.get_batch_status("batch-1").await.expect("status"),
        BatchStatus::Cancelled
    );

    h.shutdown().await;
}

#[tokio::test]
async fn requeued_record_gets_a_fresh_attempt_and_completes() {
    let mut h = Harness::new(quick_config());
    let records = h.seed_batch("batch-1", &["a1"]).await;

    h.spawn_uniform_workers(0.75);
    h.start().await;

    // First attempt never happened: the record is failed (say, by a
    // previous timeout) and the operator requeues it.
    h.store
        .mark_record_status("resp-0", RecordStatus::Failed)
        .await
        .expect("mark");

    let outcome = h
        .facade
        .requeue_failed(&records[0].response_id, "operator retry")
        .await
        .expect("requeue");
    assert!(matches!(outcome, RequeueOutcome::Requeued { .. }));

    h.wait_for_drained("batch-1", Duration::from_secs(5)).await;

    let record = h.store.get_record("resp-0").await.expect("get");
    assert_eq!(record.status, RecordStatus::Completed);
    assert_eq!(record.retry_count, 1);

    let evaluation = h
        .store
        .get_evaluation("resp-0")
        .await
        .expect("get")
        .expect("evaluation written");
    assert!((evaluation.final_score - 0.75).abs() < 1e-9);

    h.shutdown().await;
}
