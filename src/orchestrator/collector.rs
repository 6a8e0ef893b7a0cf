//! Collector loop and finaliser.
//!
//! Drains the shared results queue, files each result into its task's
//! partial-result hash, and finalises the task once all five dimensions have
//! reported. Finalisation is idempotent: the store's uniqueness constraint on
//! evaluations makes concurrent or repeated finalisations collapse into one
//! write, and re-entry after the hash is gone is a no-op.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::broker::{names, Broker};
use crate::config::OrchestratorConfig;
use crate::dimension::Dimension;
use crate::metrics;
use crate::progress::BatchProgressProjector;
use crate::record::{Evaluation, RecordStatus};
use crate::scoring;
use crate::store::{Store, StoreError};
use crate::task::DimensionResult;

use super::inflight::InFlightTable;

pub(crate) struct CollectorLoop {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) inflight: Arc<InFlightTable>,
    pub(crate) projector: BatchProgressProjector,
    pub(crate) config: OrchestratorConfig,
    pub(crate) shutdown_rx: broadcast::Receiver<()>,
}

impl CollectorLoop {
    /// Runs until a shutdown signal arrives.
    pub(crate) async fn run(mut self) {
        info!("Collector loop started");

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                popped = self.broker.pop_head_timeout(
                    names::RESULTS_QUEUE,
                    self.config.results_pop_timeout,
                    self.config.poll_interval,
                ) => {
                    match popped {
                        Ok(Some(payload)) => self.collect_one(&payload).await,
                        Ok(None) => {}
                        Err(e) => {
                            error!(error = %e, "Results queue pop failed");
                            tokio::time::sleep(self.config.dispatch_backoff).await;
                        }
                    }
                }
            }
        }

        info!("Collector loop stopped");
    }

    /// Files one result into its task's partial-result hash and finalises
    /// the task when the fifth dimension arrives.
    ///
    /// Writing the same dimension twice overwrites the field, so duplicate
    /// deliveries neither grow the hash nor trigger a second finalisation
    /// with different inputs.
    pub(crate) async fn collect_one(&self, payload: &str) {
        let result: DimensionResult = match serde_json::from_str(payload) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Dropping malformed result payload");
                return;
            }
        };

        metrics::record_result_collected(result.dimension.as_str());

        let key = names::partial_results_key(&result.task_id);

        if let Err(e) = self
            .broker
            .hash_set(&key, result.dimension.as_str(), payload)
            .await
        {
            error!(
                task_id = %result.task_id,
                dimension = %result.dimension,
                error = %e,
                "Failed to record partial result"
            );
            return;
        }

        if let Err(e) = self
            .broker
            .expire(&key, self.config.partial_results_ttl)
            .await
        {
            warn!(task_id = %result.task_id, error = %e, "Failed to refresh partial-result TTL");
        }

        let fields = match self.broker.hash_len(&key).await {
            Ok(len) => len,
            Err(e) => {
                error!(task_id = %result.task_id, error = %e, "Failed to count partial results");
                return;
            }
        };

        debug!(
            task_id = %result.task_id,
            dimension = %result.dimension,
            fields,
            "Partial result recorded"
        );

        if fields >= Dimension::ALL.len() {
            self.finalise(&result.task_id).await;
        }
    }

    /// Aggregates a complete task and materialises its evaluation.
    ///
    /// Safe under concurrent invocation for the same task id: the first
    /// writer wins the evaluation's uniqueness constraint and every other
    /// invocation just cleans up. Re-entry after the partial-result hash has
    /// been deleted is a no-op.
    pub(crate) async fn finalise(&self, task_id: &str) {
        let key = names::partial_results_key(task_id);

        let fields = match self.broker.hash_get_all(&key).await {
            Ok(fields) => fields,
            Err(e) => {
                error!(task_id, error = %e, "Failed to read partial results");
                return;
            }
        };

        if fields.is_empty() {
            // A concurrent finalisation already consumed the hash.
            debug!(task_id, "No partial results, nothing to finalise");
            return;
        }

        let mut results: BTreeMap<Dimension, DimensionResult> = BTreeMap::new();
        for (field, value) in &fields {
            let dimension: Dimension = match field.parse() {
                Ok(dimension) => dimension,
                Err(_) => {
                    warn!(task_id, field, "Unknown dimension field in partial results");
                    continue;
                }
            };
            match serde_json::from_str::<DimensionResult>(value) {
                Ok(result) => {
                    results.insert(dimension, result);
                }
                Err(e) => {
                    warn!(task_id, dimension = %dimension, error = %e, "Dropping malformed stored result");
                }
            }
        }

        let Some(sample) = results.values().next() else {
            warn!(task_id, "Partial results unusable, dropping");
            let _ = self.broker.del(&key).await;
            self.inflight.remove(task_id);
            return;
        };

        // Resolve record identity: the in-flight entry is the fast path, the
        // result payloads carry the same ids, and the store settles anything
        // still missing (e.g. after an orchestrator restart).
        let entry = self.inflight.get(task_id);

        let response_id = match &entry {
            Some(entry) if !entry.response_id.is_empty() => entry.response_id.clone(),
            _ if !sample.response_id.is_empty() => sample.response_id.clone(),
            _ => {
                warn!(task_id, "Cannot determine record for task, dropping results");
                let _ = self.broker.del(&key).await;
                self.inflight.remove(task_id);
                return;
            }
        };

        let mut batch_id = entry
            .as_ref()
            .map(|e| e.batch_id.clone())
            .unwrap_or_default();
        if batch_id.is_empty() {
            batch_id = sample.batch_id.clone();
        }
        let mut agent_id = sample.agent_id.clone();

        if batch_id.is_empty() || agent_id.is_empty() {
            match self.store.get_record(&response_id).await {
                Ok(record) => {
                    if batch_id.is_empty() {
                        batch_id = record.batch_id;
                    }
                    if agent_id.is_empty() {
                        agent_id = record.agent_id;
                    }
                }
                Err(e) => {
                    warn!(
                        task_id,
                        response_id = %response_id,
                        error = %e,
                        "Cannot resolve record for finalisation, dropping results"
                    );
                    let _ = self.broker.del(&key).await;
                    self.inflight.remove(task_id);
                    return;
                }
            }
        }

        let outcome = scoring::aggregate(&results, &self.config.weights);

        let processing_time_ms = entry
            .as_ref()
            .map(|e| e.age().as_millis() as u64)
            .unwrap_or_else(|| {
                results
                    .values()
                    .map(|r| r.processing_time_ms)
                    .max()
                    .unwrap_or(0)
            });

        let evaluation = Evaluation {
            response_id: response_id.clone(),
            batch_id: batch_id.clone(),
            agent_id,
            scores: outcome.scores.clone(),
            final_score: outcome.final_score,
            processing_errors: outcome.errors.clone(),
            processing_time_ms,
            processed_at: Utc::now(),
        };

        match self.store.write_evaluation(&evaluation).await {
            Ok(()) => {
                // All five dimensions erroring is a failure, not a success:
                // the evaluation records what happened but the record does
                // not count as completed.
                let status = if outcome.all_errored() {
                    RecordStatus::Failed
                } else {
                    RecordStatus::Completed
                };

                match self.store.mark_record_status(&response_id, status).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(
                            task_id,
                            response_id = %response_id,
                            "Record already terminal, leaving its status"
                        );
                    }
                    Err(e) => {
                        warn!(response_id = %response_id, error = %e, "Failed to update record status");
                    }
                }

                if let Err(e) = self.broker.del(&key).await {
                    warn!(task_id, error = %e, "Failed to delete partial results");
                }
                self.inflight.remove(task_id);
                metrics::set_in_flight(self.inflight.len());
                metrics::record_finalized(status.as_str());
                metrics::observe_final_score(outcome.final_score);

                if let Err(e) = self.projector.refresh(&batch_id).await {
                    warn!(batch_id = %batch_id, error = %e, "Progress refresh failed");
                }

                info!(
                    task_id,
                    response_id = %response_id,
                    batch_id = %batch_id,
                    final_score = outcome.final_score,
                    errors = outcome.errors.len(),
                    "Task finalised"
                );
            }
            Err(StoreError::Conflict(_)) => {
                // Another finaliser won; the evaluation exists. Clean up.
                debug!(
                    task_id,
                    response_id = %response_id,
                    "Evaluation already written, cleaning up"
                );
                let _ = self.broker.del(&key).await;
                self.inflight.remove(task_id);
                metrics::set_in_flight(self.inflight.len());
                metrics::record_finalized("conflict");
            }
            Err(e) => {
                error!(
                    task_id,
                    response_id = %response_id,
                    batch_id = %batch_id,
                    error = %e,
                    "Failed to write evaluation, failing record"
                );
                // Keep the partial results for diagnostics; the TTL purges
                // them.
                let _ = self
                    .store
                    .mark_record_status(&response_id, RecordStatus::Failed)
                    .await;
                self.inflight.remove(task_id);
                metrics::set_in_flight(self.inflight.len());
                metrics::record_finalized("failed");

                if let Err(e) = self.projector.refresh(&batch_id).await {
                    warn!(batch_id = %batch_id, error = %e, "Progress refresh failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::record::{BatchStatus, ResponseRecord};
    use crate::store::InMemoryStore;
    use crate::task::EvalTask;
    use std::time::Duration;

    use super::super::inflight::InFlightEntry;

    struct Harness {
        broker: Arc<InMemoryBroker>,
        store: Arc<InMemoryStore>,
        inflight: Arc<InFlightTable>,
        collector: CollectorLoop,
    }

    fn harness() -> Harness {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(InMemoryStore::new());
        let inflight = Arc::new(InFlightTable::new());
        let projector = BatchProgressProjector::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&store) as Arc<dyn Store>,
            Duration::from_secs(60),
        );
        let (_, shutdown_rx) = broadcast::channel(1);
        let collector = CollectorLoop {
            broker: Arc::clone(&broker) as Arc<dyn Broker>,
            store: Arc::clone(&store) as Arc<dyn Store>,
            inflight: Arc::clone(&inflight),
            projector,
            config: OrchestratorConfig::default(),
            shutdown_rx,
        };
        Harness {
            broker,
            store,
            inflight,
            collector,
        }
    }

    async fn seed_processing_record(h: &Harness) -> EvalTask {
        let record = ResponseRecord::new("r-1", "b-1", "agent-a", "p", "answer");
        h.store.insert_record(&record).await.expect("insert");
        h.store
            .mark_record_status("r-1", RecordStatus::Processing)
            .await
            .expect("mark");
        let task = EvalTask::from_record(&record, 0);
        h.inflight
            .insert(task.task_id.clone(), InFlightEntry::new("r-1", "b-1"));
        task
    }

    fn result_payload(task: &EvalTask, dimension: Dimension, score: f64, error: Option<&str>) -> String {
        serde_json::to_string(&DimensionResult {
            task_id: task.task_id.clone(),
            dimension,
            response_id: task.response_id.clone(),
            batch_id: task.batch_id.clone(),
            agent_id: task.agent_id.clone(),
            score,
            details: serde_json::Value::Null,
            error: error.map(str::to_string),
            processing_time_ms: 25,
            worker_id: "w-1".to_string(),
        })
        .expect("serialize")
    }

    #[tokio::test]
    async fn test_five_results_finalise_the_task() {
        let h = harness();
        let task = seed_processing_record(&h).await;

        for dimension in Dimension::ALL {
            h.collector
                .collect_one(&result_payload(&task, dimension, 0.8, None))
                .await;
        }

        let evaluation = h
            .store
            .get_evaluation("r-1")
            .await
            .expect("get")
            .expect("evaluation written");
        assert!((evaluation.final_score - 0.8).abs() < 1e-9);
        assert!(evaluation.processing_errors.is_empty());
        assert_eq!(evaluation.scores.len(), 5);

        assert_eq!(
            h.store.get_record("r-1").await.expect("get").status,
            RecordStatus::Completed
        );
        // Hash cleaned up, in-flight entry released.
        assert_eq!(
            h.broker
                .hash_len(&names::partial_results_key(&task.task_id))
                .await
                .expect("hlen"),
            0
        );
        assert!(h.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_four_results_do_not_finalise() {
        let h = harness();
        let task = seed_processing_record(&h).await;

        for dimension in Dimension::ALL.into_iter().take(4) {
            h.collector
                .collect_one(&result_payload(&task, dimension, 0.8, None))
                .await;
        }

        assert!(h
            .store
            .get_evaluation("r-1")
            .await
            .expect("get")
            .is_none());
        assert_eq!(
            h.broker
                .hash_len(&names::partial_results_key(&task.task_id))
                .await
                .expect("hlen"),
            4
        );
        assert_eq!(h.inflight.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_results_yield_one_evaluation() {
        let h = harness();
        let task = seed_processing_record(&h).await;

        // Every dimension delivered twice.
        for _ in 0..2 {
            for dimension in Dimension::ALL {
                h.collector
                    .collect_one(&result_payload(&task, dimension, 0.8, None))
                    .await;
            }
        }

        assert_eq!(h.store.evaluation_count(), 1);
        let evaluation = h
            .store
            .get_evaluation("r-1")
            .await
            .expect("get")
            .expect("evaluation");
        assert!((evaluation.final_score - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_finalise_after_hash_deleted_is_noop() {
        let h = harness();
        let task = seed_processing_record(&h).await;

        h.collector.finalise(&task.task_id).await;

        assert!(h
            .store
            .get_evaluation("r-1")
            .await
            .expect("get")
            .is_none());
        // The in-flight entry survives an empty finalisation; the real one
        // or the sweeper will release it.
        assert_eq!(h.inflight.len(), 1);
    }

    #[tokio::test]
    async fn test_all_errored_marks_record_failed() {
        let h = harness();
        let task = seed_processing_record(&h).await;

        for dimension in Dimension::ALL {
            h.collector
                .collect_one(&result_payload(&task, dimension, 0.0, Some("worker crash")))
                .await;
        }

        let evaluation = h
            .store
            .get_evaluation("r-1")
            .await
            .expect("get")
            .expect("evaluation written");
        assert_eq!(evaluation.final_score, 0.0);
        assert_eq!(evaluation.processing_errors.len(), 5);

        assert_eq!(
            h.store.get_record("r-1").await.expect("get").status,
            RecordStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_conflict_cleans_up_without_overwriting() {
        let h = harness();
        let task = seed_processing_record(&h).await;

        // A previous finalisation already wrote the evaluation.
        let existing = Evaluation {
            response_id: "r-1".to_string(),
            batch_id: "b-1".to_string(),
            agent_id: "agent-a".to_string(),
            scores: BTreeMap::new(),
            final_score: 0.42,
            processing_errors: Vec::new(),
            processing_time_ms: 5,
            processed_at: Utc::now(),
        };
        h.store.write_evaluation(&existing).await.expect("write");

        for dimension in Dimension::ALL {
            h.collector
                .collect_one(&result_payload(&task, dimension, 0.9, None))
                .await;
        }

        // The original evaluation is untouched and the hash is cleaned up.
        let evaluation = h
            .store
            .get_evaluation("r-1")
            .await
            .expect("get")
            .expect("evaluation");
        assert!((evaluation.final_score - 0.42).abs() < 1e-9);
        assert_eq!(h.store.evaluation_count(), 1);
        assert_eq!(
            h.broker
                .hash_len(&names::partial_results_key(&task.task_id))
                .await
                .expect("hlen"),
            0
        );
        assert!(h.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_finalise_without_inflight_entry_uses_result_identity() {
        let h = harness();
        let task = seed_processing_record(&h).await;

        // Simulate a restart: the in-flight table lost the entry but the
        // partial results still carry the record identity.
        h.inflight.remove(&task.task_id);

        for dimension in Dimension::ALL {
            h.collector
                .collect_one(&result_payload(&task, dimension, 0.7, None))
                .await;
        }

        let evaluation = h
            .store
            .get_evaluation("r-1")
            .await
            .expect("get")
            .expect("evaluation written");
        assert_eq!(evaluation.batch_id, "b-1");
        assert_eq!(evaluation.agent_id, "agent-a");
        assert!((evaluation.final_score - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_finalisation_completes_batch() {
        let h = harness();
        h.store.insert_batch("b-1", 1).await.expect("batch");
        let task = seed_processing_record(&h).await;

        for dimension in Dimension::ALL {
            h.collector
                .collect_one(&result_payload(&task, dimension, 0.8, None))
                .await;
        }

        assert_eq!(
            h.store.get_batch_status("b-1").await.expect("status"),
            BatchStatus::Completed
        );
        let progress = h.store.get_batch_progress("b-1").await.expect("progress");
        assert_eq!(progress.completed, 1);
        assert!(progress.is_drained());
    }

    #[tokio::test]
    async fn test_malformed_result_payload_is_dropped() {
        let h = harness();
        h.collector.collect_one("{ not json").await;
        assert_eq!(h.store.evaluation_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_score_recorded_as_error() {
        let h = harness();
        let task = seed_processing_record(&h).await;

        for dimension in Dimension::ALL.into_iter().take(4) {
            h.collector
                .collect_one(&result_payload(&task, dimension, 0.6, None))
                .await;
        }
        h.collector
            .collect_one(&result_payload(&task, Dimension::Accuracy, 2.5, None))
            .await;

        let evaluation = h
            .store
            .get_evaluation("r-1")
            .await
            .expect("get")
            .expect("evaluation written");
        assert_eq!(evaluation.scores[&Dimension::Accuracy], 0.0);
        assert_eq!(evaluation.processing_errors.len(), 1);
        assert!((evaluation.final_score - 0.6).abs() < 1e-9);
        assert_eq!(
            h.store.get_record("r-1").await.expect("get").status,
            RecordStatus::Completed
        );
    }
}
