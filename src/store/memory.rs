//! In-memory store implementation for testing.
//!
//! Provides [`InMemoryStore`], a thread-safe implementation of the [`Store`]
//! trait with the same semantics as the PostgreSQL backend: unique
//! evaluations per response, sticky terminal statuses, and progress derived
//! from record statuses.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::record::{BatchProgress, BatchStatus, Evaluation, RecordStatus, ResponseRecord};

use super::{Store, StoreError};

/// Converts a lock poison error to a store error.
fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Query("lock poisoned".to_string())
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, ResponseRecord>,
    evaluations: HashMap<String, Evaluation>,
    batches: HashMap<String, BatchStatus>,
}

impl Inner {
    fn progress_for(&self, batch_id: &str) -> BatchProgress {
        let mut progress = BatchProgress::default();
        for record in self.records.values().filter(|r| r.batch_id == batch_id) {
            progress.total += 1;
            match record.status {
                RecordStatus::Pending | RecordStatus::Queued => progress.pending += 1,
                RecordStatus::Processing => progress.processing += 1,
                RecordStatus::Completed => progress.completed += 1,
                RecordStatus::Failed => progress.failed += 1,
                RecordStatus::Cancelled => progress.cancelled += 1,
            }
        }
        progress
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of evaluations written so far (test helper).
    pub fn evaluation_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .evaluations
            .len()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_batch(&self, batch_id: &str, _total: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        if inner.batches.contains_key(batch_id) {
            return Err(StoreError::Conflict(format!(
                "batch {} already exists",
                batch_id
            )));
        }
        inner
            .batches
            .insert(batch_id.to_string(), BatchStatus::Processing);
        Ok(())
    }

    async fn insert_record(&self, record: &ResponseRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        if inner.records.contains_key(&record.response_id) {
            return Err(StoreError::Conflict(format!(
                "record {} already exists",
                record.response_id
            )));
        }
        inner
            .records
            .insert(record.response_id.clone(), record.clone());
        Ok(())
    }

    async fn get_record(&self, response_id: &str) -> Result<ResponseRecord, StoreError> {
        let inner = self.inner.lock().map_err(poison_err)?;
        inner
            .records
            .get(response_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("record {}", response_id)))
    }

    async fn mark_record_status(
        &self,
        response_id: &str,
        status: RecordStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        let record = inner
            .records
            .get_mut(response_id)
            .ok_or_else(|| StoreError::NotFound(format!("record {}", response_id)))?;

        // Terminal statuses are sticky; only the requeue path may leave them.
        if record.status.is_terminal() && status != RecordStatus::Queued {
            return Ok(false);
        }

        record.status = status;
        Ok(true)
    }

    async fn set_retry_count(
        &self,
        response_id: &str,
        retry_count: u32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        let record = inner
            .records
            .get_mut(response_id)
            .ok_or_else(|| StoreError::NotFound(format!("record {}", response_id)))?;
        record.retry_count = retry_count;
        Ok(())
    }

    async fn write_evaluation(&self, evaluation: &Evaluation) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        if inner.evaluations.contains_key(&evaluation.response_id) {
            return Err(StoreError::Conflict(format!(
                "evaluation for {} already exists",
                evaluation.response_id
            )));
        }
        inner
            .evaluations
            .insert(evaluation.response_id.clone(), evaluation.clone());
        Ok(())
    }

    async fn get_evaluation(&self, response_id: &str) -> Result<Option<Evaluation>, StoreError> {
        let inner = self.inner.lock().map_err(poison_err)?;
        Ok(inner.evaluations.get(response_id).cloned())
    }

    async fn get_batch_progress(&self, batch_id: &str) -> Result<BatchProgress, StoreError> {
        let inner = self.inner.lock().map_err(poison_err)?;
        Ok(inner.progress_for(batch_id))
    }

    async fn get_batch_status(&self, batch_id: &str) -> Result<BatchStatus, StoreError> {
        let inner = self.inner.lock().map_err(poison_err)?;
        inner
            .batches
            .get(batch_id)
            .copied()
            .ok_or_else(|| StoreError::NotFound(format!("batch {}", batch_id)))
    }

    async fn set_batch_status(
        &self,
        batch_id: &str,
        status: BatchStatus,
        _progress: &BatchProgress,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        inner.batches.insert(batch_id.to_string(), status);
        Ok(())
    }

    async fn cancel_pending_records(&self, batch_id: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().map_err(poison_err)?;
        let mut cancelled = 0;
        for record in inner.records.values_mut().filter(|r| r.batch_id == batch_id) {
            if matches!(record.status, RecordStatus::Pending | RecordStatus::Queued) {
                record.status = RecordStatus::Cancelled;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }
}
