//! Dispatch loop.
//!
//! Drains the main queue under the concurrency cap and fans each task out to
//! the five dimension queues. While the in-flight table is at the cap the
//! loop does not pop: the main queue itself is the backpressure buffer.
//!
//! The five dimension pushes run concurrently and are all attempted before
//! the loop considers another task. A failed push is not retried here; the
//! affected task simply never completes and the timeout sweeper fails it.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::broker::{names, Broker};
use crate::config::OrchestratorConfig;
use crate::metrics;
use crate::progress::BatchProgressProjector;
use crate::record::RecordStatus;
use crate::store::Store;
use crate::task::EvalTask;

use super::inflight::{InFlightEntry, InFlightTable};

pub(crate) struct DispatchLoop {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) inflight: Arc<InFlightTable>,
    pub(crate) projector: BatchProgressProjector,
    pub(crate) config: OrchestratorConfig,
    pub(crate) shutdown_rx: broadcast::Receiver<()>,
}

impl DispatchLoop {
    /// Runs until a shutdown signal arrives.
    pub(crate) async fn run(mut self) {
        info!("Dispatch loop started");

        loop {
            // At the cap the loop must not pop; the main queue holds the
            // backlog until the collector or the sweeper frees a slot.
            if self.inflight.len() >= self.config.max_concurrent_tasks {
                tokio::select! {
                    _ = self.shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(self.config.dispatch_backoff) => continue,
                }
            }

            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                popped = self.broker.pop_head_timeout(
                    names::MAIN_QUEUE,
                    self.config.main_pop_timeout,
                    self.config.poll_interval,
                ) => {
                    match popped {
                        Ok(Some(payload)) => self.dispatch_one(&payload).await,
                        Ok(None) => {
                            // Pop window expired with nothing queued; the
                            // next iteration re-checks capacity and polls
                            // again.
                        }
                        Err(e) => {
                            error!(error = %e, "Main queue pop failed");
                            tokio::time::sleep(self.config.dispatch_backoff).await;
                        }
                    }
                }
            }
        }

        info!("Dispatch loop stopped");
    }

    /// Dispatches one popped task: mark processing, register in flight, fan
    /// out to the dimension queues, refresh batch progress.
    ///
    /// Never propagates an error: every failure path logs, settles the
    /// record where possible, and returns so the loop keeps running.
    pub(crate) async fn dispatch_one(&self, payload: &str) {
        let task: EvalTask = match serde_json::from_str(payload) {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, "Dropping malformed main-queue payload");
                return;
            }
        };

        match self
            .store
            .mark_record_status(&task.response_id, RecordStatus::Processing)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // The record reached a terminal status while its task sat on
                // the queue (batch cancel, operator action). Drop the task.
                debug!(
                    task_id = %task.task_id,
                    response_id = %task.response_id,
                    "Record already terminal, skipping task"
                );
                return;
            }
            Err(e) => {
                error!(
                    task_id = %task.task_id,
                    response_id = %task.response_id,
                    batch_id = %task.batch_id,
                    error = %e,
                    "Failed to mark record processing, failing this attempt"
                );
                if let Err(e) = self
                    .store
                    .mark_record_status(&task.response_id, RecordStatus::Failed)
                    .await
                {
                    warn!(response_id = %task.response_id, error = %e, "Failed to mark record failed");
                }
                if let Err(e) = self.projector.refresh(&task.batch_id).await {
                    warn!(batch_id = %task.batch_id, error = %e, "Progress refresh failed");
                }
                return;
            }
        }

        self.inflight.insert(
            task.task_id.clone(),
            InFlightEntry::new(&task.response_id, &task.batch_id),
        );
        metrics::record_dispatched();
        metrics::set_in_flight(self.inflight.len());

        // All five pushes are attempted regardless of individual failures;
        // a missing subtask surfaces as a timeout, not a partial dispatch.
        let pushes: Vec<_> = task
            .dimensions
            .iter()
            .map(|&dimension| {
                let subtask = task.to_dimension_task(dimension);
                let broker = Arc::clone(&self.broker);
                async move {
                    let payload = serde_json::to_string(&subtask)
                        .map_err(|e| (dimension, e.to_string()))?;
                    broker
                        .append(&names::dimension_queue(dimension), &payload)
                        .await
                        .map_err(|e| (dimension, e.to_string()))
                }
            })
            .collect();

        for (dimension, error) in join_all(pushes).await.into_iter().filter_map(Result::err) {
            warn!(
                task_id = %task.task_id,
                response_id = %task.response_id,
                dimension = %dimension,
                error = %error,
                "Dimension push failed; sweeper will fail the task if it stays incomplete"
            );
        }

        if let Err(e) = self.projector.refresh(&task.batch_id).await {
            warn!(batch_id = %task.batch_id, error = %e, "Progress refresh failed");
        }

        debug!(
            task_id = %task.task_id,
            response_id = %task.response_id,
            batch_id = %task.batch_id,
            "Task fanned out"
        );
    }
}
