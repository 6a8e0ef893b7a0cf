//! Persistent store interface.
//!
//! The store is the authority for records, evaluations, and batch summaries.
//! The orchestrator never holds durable state of its own: the in-flight table
//! is a deadline accelerator that can be rebuilt, and everything else lives
//! here or in the broker.
//!
//! Two invariants are enforced at this boundary:
//!
//! - An evaluation is written at most once per response: a second write for
//!   the same `response_id` fails with [`StoreError::Conflict`], which the
//!   finaliser reads as "already finalised".
//! - Terminal record statuses (completed, failed, cancelled) are never
//!   overwritten by the orchestrator loops; only an explicit requeue moves a
//!   record back to `queued`.

pub mod memory;
pub mod migrations;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{BatchProgress, BatchStatus, Evaluation, RecordStatus, ResponseRecord};

pub use memory::InMemoryStore;
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
pub use postgres::PostgresStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the store failed.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Store query failed: {0}")]
    Query(String),

    /// The requested row does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint rejected the write.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] migrations::MigrationError),
}

/// Persistence operations the orchestrator and the enqueue facade rely on.
#[async_trait]
pub trait Store: Send + Sync {
    /// Creates a batch row with the declared record count.
    async fn insert_batch(&self, batch_id: &str, total: u64) -> Result<(), StoreError>;

    /// Persists a new record. Fails with `Conflict` when the id exists.
    async fn insert_record(&self, record: &ResponseRecord) -> Result<(), StoreError>;

    /// Loads a record by id.
    async fn get_record(&self, response_id: &str) -> Result<ResponseRecord, StoreError>;

    /// Transitions a record's status.
    ///
    /// Returns `Ok(true)` when the row transitioned and `Ok(false)` when the
    /// record exists but sits in a terminal status the transition may not
    /// overwrite. Moving back to `queued` (the requeue path) is always
    /// permitted.
    async fn mark_record_status(
        &self,
        response_id: &str,
        status: RecordStatus,
    ) -> Result<bool, StoreError>;

    /// Persists a record's retry count.
    async fn set_retry_count(&self, response_id: &str, retry_count: u32)
        -> Result<(), StoreError>;

    /// Writes an evaluation. Fails with `Conflict` when one already exists
    /// for the response id.
    async fn write_evaluation(&self, evaluation: &Evaluation) -> Result<(), StoreError>;

    /// Loads the evaluation for a record, if one has been written.
    async fn get_evaluation(&self, response_id: &str) -> Result<Option<Evaluation>, StoreError>;

    /// Aggregates per-status record counts for a batch.
    async fn get_batch_progress(&self, batch_id: &str) -> Result<BatchProgress, StoreError>;

    /// Returns the batch's current status.
    async fn get_batch_status(&self, batch_id: &str) -> Result<BatchStatus, StoreError>;

    /// Sets the batch status together with a progress snapshot.
    async fn set_batch_status(
        &self,
        batch_id: &str,
        status: BatchStatus,
        progress: &BatchProgress,
    ) -> Result<(), StoreError>;

    /// Transitions every not-yet-processing, non-terminal record of a batch
    /// to `cancelled`. Returns the number of records transitioned.
    async fn cancel_pending_records(&self, batch_id: &str) -> Result<u64, StoreError>;
}
