//! Queue broker interface.
//!
//! The orchestrator keeps all cross-process state in a key/list/hash-capable
//! broker: the main task queue, one queue per dimension, the shared results
//! queue, per-task partial-result hashes, batch-progress snapshots, and
//! worker liveness keys.
//!
//! The interface is deliberately non-blocking: `pop_head` returns immediately
//! and callers simulate blocking with `pop_head_timeout`, which polls at a
//! configurable cadence. A broker with native blocking pops can still
//! implement this trait; the callers see the same contract either way.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::InMemoryBroker;
pub use self::redis::RedisBroker;

/// Queue and key names used by the orchestrator.
pub mod names {
    use crate::dimension::Dimension;

    /// Main task queue fed by the enqueue facade.
    pub const MAIN_QUEUE: &str = "main_evaluation_tasks";

    /// Shared results queue drained by the collector loop.
    pub const RESULTS_QUEUE: &str = "dimension_results";

    /// Control key the CLI uses to request a graceful shutdown.
    pub const CONTROL_KEY: &str = "orchestrator:control";

    /// Heartbeat key a running orchestrator refreshes with its in-flight
    /// count, so `status` can report it from another process.
    pub const ORCHESTRATOR_STATUS_KEY: &str = "orchestrator:status";

    /// Pattern matching every partial-result hash.
    pub const PARTIAL_RESULTS_PATTERN: &str = "task:*:results";

    /// Pattern matching every batch progress snapshot.
    pub const BATCH_PROGRESS_PATTERN: &str = "batch:*:progress";

    /// Pattern matching every worker liveness key.
    pub const WORKER_STATUS_PATTERN: &str = "worker:*:status";

    /// Queue drained by one dimension's worker pool.
    pub fn dimension_queue(dimension: Dimension) -> String {
        dimension.queue_name()
    }

    /// Hash collecting the partial results for one task.
    pub fn partial_results_key(task_id: &str) -> String {
        format!("task:{}:results", task_id)
    }

    /// Extracts the task id from a partial-result hash key.
    pub fn task_id_from_partial_key(key: &str) -> Option<&str> {
        key.strip_prefix("task:")?.strip_suffix(":results")
    }

    /// Progress snapshot key for one batch.
    pub fn batch_progress_key(batch_id: &str) -> String {
        format!("batch:{}:progress", batch_id)
    }

    /// Liveness key for one worker.
    pub fn worker_status_key(worker_id: &str) -> String {
        format!("worker:{}:status", worker_id)
    }
}

/// Errors that can occur during broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Failed to connect to the broker.
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    /// A broker operation failed.
    #[error("Broker operation failed: {0}")]
    Backend(String),

    /// Failed to serialize or deserialize a payload.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key/list/hash operations the orchestrator needs from its broker.
///
/// Payloads are JSON strings; encoding and decoding stay with the callers so
/// the broker moves opaque bytes.
#[async_trait]
pub trait Broker: Send + Sync {
    // List operations (FIFO: push-tail, pop-head)

    /// Appends a payload to the tail of the named queue.
    async fn append(&self, queue: &str, payload: &str) -> Result<(), BrokerError>;

    /// Pops the head of the named queue. Non-blocking; `None` when empty.
    async fn pop_head(&self, queue: &str) -> Result<Option<String>, BrokerError>;

    /// Returns the number of entries in the named queue.
    async fn len(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Removes every entry from the named queue.
    async fn clear(&self, queue: &str) -> Result<(), BrokerError>;

    // Hash operations (string fields, per-key TTL)

    /// Sets one field of a hash. Overwrites an existing field.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BrokerError>;

    /// Returns the number of fields in a hash (0 when absent).
    async fn hash_len(&self, key: &str) -> Result<usize, BrokerError>;

    /// Returns all fields of a hash (empty when absent).
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError>;

    /// Deletes a key of any type.
    async fn del(&self, key: &str) -> Result<(), BrokerError>;

    /// Sets a TTL on an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError>;

    // Key/value operations

    /// Sets a string value with a TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// Returns the value of a key, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<String>, BrokerError>;

    /// Returns the values for several keys, preserving order.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, BrokerError>;

    /// Returns the keys matching a glob pattern (`*` wildcards).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError>;

    /// Simulates a blocking pop by polling `pop_head` until a payload arrives
    /// or `timeout` elapses.
    async fn pop_head_timeout(
        &self,
        queue: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<String>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(payload) = self.pop_head(queue).await? {
                return Ok(Some(payload));
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::Dimension;

    #[test]
    fn test_queue_names() {
        assert_eq!(names::MAIN_QUEUE, "main_evaluation_tasks");
        assert_eq!(names::RESULTS_QUEUE, "dimension_results");
        assert_eq!(
            names::dimension_queue(Dimension::Hallucination),
            "dimension_queue:hallucination"
        );
    }

    #[test]
    fn test_key_shapes() {
        assert_eq!(names::partial_results_key("t-1"), "task:t-1:results");
        assert_eq!(names::batch_progress_key("b-1"), "batch:b-1:progress");
        assert_eq!(names::worker_status_key("w-1"), "worker:w-1:status");
    }

    #[test]
    fn test_task_id_from_partial_key() {
        assert_eq!(
            names::task_id_from_partial_key("task:abc-123:results"),
            Some("abc-123")
        );
        assert_eq!(names::task_id_from_partial_key("batch:b:progress"), None);
        assert_eq!(names::task_id_from_partial_key("task:abc-123"), None);
    }
}
