//! Enqueue facade.
//!
//! The boundary between ingestion and the orchestrator: converts a batch of
//! persisted records into tasks on the main queue, initialises the batch's
//! progress, and owns the task-level retry policy. Only `requeue_failed`
//! creates a new attempt for a failed record; the orchestrator itself never
//! auto-retries.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::broker::{names, Broker, BrokerError};
use crate::progress::{BatchProgressProjector, ProgressError};
use crate::record::{BatchStatus, RecordStatus, ResponseRecord};
use crate::store::{Store, StoreError};
use crate::task::EvalTask;

/// Bounded attempts for a single main-queue push.
const PUSH_ATTEMPTS: u32 = 3;

/// Backoff between push attempts, scaled by the attempt number.
const PUSH_BACKOFF: Duration = Duration::from_millis(50);

/// Errors that can occur in the enqueue facade.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] BrokerError),

    #[error("Progress error: {0}")]
    Progress(#[from] ProgressError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outcome of a requeue request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// A fresh task was pushed onto the main queue.
    Requeued {
        /// The new attempt's task id.
        task_id: String,
    },
    /// The record has exhausted its retry budget; no task was created.
    RetryExhausted,
}

/// Converts uploaded batches into main-queue tasks and applies the
/// task-level retry policy.
pub struct EnqueueFacade {
    broker: Arc<dyn Broker>,
    store: Arc<dyn Store>,
    projector: BatchProgressProjector,
    max_retries: u32,
}

impl EnqueueFacade {
    /// Creates a facade over the given collaborators.
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn Store>,
        max_retries: u32,
        snapshot_ttl: Duration,
    ) -> Self {
        let projector =
            BatchProgressProjector::new(Arc::clone(&broker), Arc::clone(&store), snapshot_ttl);
        Self {
            broker,
            store,
            projector,
            max_retries,
        }
    }

    /// Injects one task per record onto the main queue and initialises the
    /// batch's progress counters.
    ///
    /// Pushes are retried a bounded number of times. If any record still
    /// cannot be queued, that record and every not-yet-queued record are
    /// marked failed, the batch status is set to failed, and the error is
    /// returned. Records queued before the failure stay queued and will be
    /// processed normally.
    pub async fn enqueue_batch(
        &self,
        batch_id: &str,
        records: &[ResponseRecord],
    ) -> Result<u64, EnqueueError> {
        info!(batch_id, count = records.len(), "Enqueueing batch");

        for (idx, record) in records.iter().enumerate() {
            let task = EvalTask::from_record(record, record.retry_count);
            let payload = serde_json::to_string(&task)?;

            if let Err(e) = self
                .store
                .mark_record_status(&record.response_id, RecordStatus::Queued)
                .await
            {
                error!(
                    batch_id,
                    response_id = %record.response_id,
                    error = %e,
                    "Failed to mark record queued, failing batch"
                );
                self.fail_rest(batch_id, &records[idx..]).await;
                return Err(e.into());
            }

            if let Err(e) = self.push_with_retry(&payload).await {
                error!(
                    batch_id,
                    response_id = %record.response_id,
                    task_id = %task.task_id,
                    error = %e,
                    "Failed to queue task, failing batch"
                );
                self.fail_rest(batch_id, &records[idx..]).await;
                return Err(e.into());
            }

            debug!(
                batch_id,
                response_id = %record.response_id,
                task_id = %task.task_id,
                "Task queued"
            );
        }

        self.projector.refresh(batch_id).await?;
        info!(batch_id, count = records.len(), "Batch enqueued");

        Ok(records.len() as u64)
    }

    /// Builds a fresh task for a failed record and pushes it back onto the
    /// main queue, incrementing the record's retry count.
    ///
    /// Returns `RetryExhausted` without creating a task when the record has
    /// already been retried `max_retries` times.
    pub async fn requeue_failed(
        &self,
        response_id: &str,
        reason: &str,
    ) -> Result<RequeueOutcome, EnqueueError> {
        let record = self.store.get_record(response_id).await?;

        if record.retry_count >= self.max_retries {
            info!(
                response_id,
                retry_count = record.retry_count,
                max_retries = self.max_retries,
                reason,
                "Retry budget exhausted, record stays failed"
            );
            return Ok(RequeueOutcome::RetryExhausted);
        }

        let retry_count = record.retry_count + 1;
        let task = EvalTask::from_record(&record, retry_count);
        let payload = serde_json::to_string(&task)?;

        self.store.set_retry_count(response_id, retry_count).await?;
        self.store
            .mark_record_status(response_id, RecordStatus::Queued)
            .await?;

        if let Err(e) = self.push_with_retry(&payload).await {
            // The record was already moved out of `failed`; put it back so
            // the operator can requeue again later.
            let _ = self
                .store
                .mark_record_status(response_id, RecordStatus::Failed)
                .await;
            return Err(e.into());
        }

        self.projector.refresh(&record.batch_id).await?;

        info!(
            response_id,
            batch_id = %record.batch_id,
            task_id = %task.task_id,
            retry_count,
            reason,
            "Record requeued"
        );

        Ok(RequeueOutcome::Requeued {
            task_id: task.task_id,
        })
    }

    /// Pauses a batch. Advisory: in-flight tasks finish naturally.
    pub async fn pause(&self, batch_id: &str) -> Result<(), EnqueueError> {
        let status = self.store.get_batch_status(batch_id).await?;
        if status != BatchStatus::Processing {
            debug!(batch_id, status = %status, "Pause ignored for non-processing batch");
            return Ok(());
        }

        let progress = self.store.get_batch_progress(batch_id).await?;
        self.store
            .set_batch_status(batch_id, BatchStatus::Paused, &progress)
            .await?;
        self.projector
            .write_snapshot(batch_id, BatchStatus::Paused, &progress)
            .await?;

        info!(batch_id, "Batch paused");
        Ok(())
    }

    /// Resumes a paused batch.
    pub async fn resume(&self, batch_id: &str) -> Result<(), EnqueueError> {
        let status = self.store.get_batch_status(batch_id).await?;
        if status != BatchStatus::Paused {
            debug!(batch_id, status = %status, "Resume ignored for non-paused batch");
            return Ok(());
        }

        let progress = self.store.get_batch_progress(batch_id).await?;
        self.store
            .set_batch_status(batch_id, BatchStatus::Processing, &progress)
            .await?;
        // The refresh settles the final status: a batch that drained while
        // paused goes straight to completed.
        self.projector.refresh(batch_id).await?;

        info!(batch_id, "Batch resumed");
        Ok(())
    }

    /// Cancels a batch: every record that has not reached the dispatch loop
    /// becomes `cancelled`; records already processing finish or time out
    /// naturally. Returns the number of records cancelled.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<u64, EnqueueError> {
        let cancelled = self.store.cancel_pending_records(batch_id).await?;

        let progress = self.store.get_batch_progress(batch_id).await?;
        self.store
            .set_batch_status(batch_id, BatchStatus::Cancelled, &progress)
            .await?;
        self.projector
            .write_snapshot(batch_id, BatchStatus::Cancelled, &progress)
            .await?;

        info!(batch_id, cancelled, "Batch cancelled");
        Ok(cancelled)
    }

    /// Pushes a payload onto the main queue with bounded retries.
    async fn push_with_retry(&self, payload: &str) -> Result<(), BrokerError> {
        let mut attempt = 0;

        loop {
            match self.broker.append(names::MAIN_QUEUE, payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= PUSH_ATTEMPTS {
                        return Err(e);
                    }
                    warn!(attempt, error = %e, "Main-queue push failed, retrying");
                    tokio::time::sleep(PUSH_BACKOFF * attempt).await;
                }
            }
        }
    }

    /// Marks the given records failed and the batch failed. Best effort:
    /// individual store errors are logged, not propagated, because the
    /// caller is already unwinding from a harder failure.
    async fn fail_rest(&self, batch_id: &str, records: &[ResponseRecord]) {
        for record in records {
            if let Err(e) = self
                .store
                .mark_record_status(&record.response_id, RecordStatus::Failed)
                .await
            {
                warn!(
                    response_id = %record.response_id,
                    error = %e,
                    "Failed to mark record failed during batch unwind"
                );
            }
        }

        match self.store.get_batch_progress(batch_id).await {
            Ok(progress) => {
                if let Err(e) = self
                    .store
                    .set_batch_status(batch_id, BatchStatus::Failed, &progress)
                    .await
                {
                    warn!(batch_id, error = %e, "Failed to mark batch failed");
                }
                let _ = self
                    .projector
                    .write_snapshot(batch_id, BatchStatus::Failed, &progress)
                    .await;
            }
            Err(e) => warn!(batch_id, error = %e, "Failed to read progress during unwind"),
        }
    }
}
