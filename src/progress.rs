//! Batch progress projection.
//!
//! Keeps the batch's status and counters consistent with the store's current
//! record statuses. The projection runs after every record transition caused
//! by dispatch, finalisation, timeout, or cancel; it reads the aggregated
//! counts, writes a TTL-bounded snapshot to the broker for cheap reads, and
//! moves the batch to `completed` once nothing is pending or processing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::broker::{names, Broker, BrokerError};
use crate::record::{BatchProgress, BatchStatus};
use crate::store::{Store, StoreError};

/// Errors that can occur while projecting batch progress.
#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Projects per-record statuses into batch-level counters and status.
#[derive(Clone)]
pub struct BatchProgressProjector {
    broker: Arc<dyn Broker>,
    store: Arc<dyn Store>,
    snapshot_ttl: Duration,
}

impl BatchProgressProjector {
    /// Creates a projector writing snapshots with the given TTL.
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn Store>, snapshot_ttl: Duration) -> Self {
        Self {
            broker,
            store,
            snapshot_ttl,
        }
    }

    /// Recomputes the batch's progress and status from record counts.
    ///
    /// Sticky statuses (paused, cancelled, failed) are preserved; otherwise
    /// the batch becomes `completed` once drained and `processing` until
    /// then. Terminal record statuses only ever grow their counters, so the
    /// projection is monotone for completed and failed records.
    pub async fn refresh(&self, batch_id: &str) -> Result<BatchProgress, ProgressError> {
        let progress = self.store.get_batch_progress(batch_id).await?;

        let current = match self.store.get_batch_status(batch_id).await {
            Ok(status) => status,
            // Ingestion may not have created the batch row yet; treat the
            // batch as live and let the upsert below create it.
            Err(StoreError::NotFound(_)) => BatchStatus::Processing,
            Err(e) => return Err(e.into()),
        };

        let next = if current.is_sticky() {
            current
        } else if progress.is_drained() {
            BatchStatus::Completed
        } else {
            BatchStatus::Processing
        };

        self.store
            .set_batch_status(batch_id, next, &progress)
            .await?;
        self.write_snapshot(batch_id, next, &progress).await?;

        debug!(
            batch_id,
            status = %next,
            pending = progress.pending,
            processing = progress.processing,
            completed = progress.completed,
            failed = progress.failed,
            cancelled = progress.cancelled,
            "Batch progress refreshed"
        );

        Ok(progress)
    }

    /// Writes the broker-side progress snapshot for cheap status reads.
    pub async fn write_snapshot(
        &self,
        batch_id: &str,
        status: BatchStatus,
        progress: &BatchProgress,
    ) -> Result<(), ProgressError> {
        let snapshot = serde_json::json!({
            "batch_id": batch_id,
            "status": status,
            "total": progress.total,
            "pending": progress.pending,
            "processing": progress.processing,
            "completed": progress.completed,
            "failed": progress.failed,
            "cancelled": progress.cancelled,
            "updated_at": Utc::now(),
        });

        self.broker
            .set_ex(
                &names::batch_progress_key(batch_id),
                &snapshot.to_string(),
                self.snapshot_ttl,
            )
            .await?;

        Ok(())
    }
}
