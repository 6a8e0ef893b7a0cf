//! Core domain entities: response records, evaluations, and batch progress.
//!
//! A `ResponseRecord` is one prompt/response pair awaiting evaluation. Records
//! belong to a batch and produce at most one `Evaluation`. Batch progress is a
//! projection of the per-record statuses held by the store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dimension::Dimension;

/// Lifecycle status of a single response record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Persisted but not yet enqueued.
    Pending,
    /// A task for this record sits on the main queue.
    Queued,
    /// The dispatch loop has fanned the record out to the dimension queues.
    Processing,
    /// An evaluation has been materialised.
    Completed,
    /// The attempt failed (timeout, store error, or all dimensions errored).
    Failed,
    /// Cancelled before reaching the dispatch loop.
    Cancelled,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Queued => "queued",
            RecordStatus::Processing => "processing",
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
            RecordStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses are never overwritten by the orchestrator loops.
    /// Only an explicit requeue moves a record out of a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordStatus::Completed | RecordStatus::Failed | RecordStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "queued" => Ok(RecordStatus::Queued),
            "processing" => Ok(RecordStatus::Processing),
            "completed" => Ok(RecordStatus::Completed),
            "failed" => Ok(RecordStatus::Failed),
            "cancelled" => Ok(RecordStatus::Cancelled),
            other => Err(format!("unknown record status '{}'", other)),
        }
    }
}

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Processing => "processing",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses the progress projection must not override.
    pub fn is_sticky(&self) -> bool {
        matches!(
            self,
            BatchStatus::Paused | BatchStatus::Cancelled | BatchStatus::Failed
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(BatchStatus::Processing),
            "paused" => Ok(BatchStatus::Paused),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "cancelled" => Ok(BatchStatus::Cancelled),
            other => Err(format!("unknown batch status '{}'", other)),
        }
    }
}

/// One agent response awaiting evaluation.
///
/// Payload fields are immutable once persisted; only `status` and
/// `retry_count` change, and only through the store contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    /// Opaque unique identifier.
    pub response_id: String,
    /// Batch this record was uploaded with.
    pub batch_id: String,
    /// Identifier of the agent that produced the response.
    pub agent_id: String,
    /// The prompt the agent answered.
    pub prompt: String,
    /// The free-text response under evaluation.
    pub response_text: String,
    /// Optional conversation context supplied by the uploader.
    #[serde(default)]
    pub context: Option<String>,
    /// Optional reference answer for accuracy scoring.
    #[serde(default)]
    pub reference: Option<String>,
    /// Opaque metadata copied through to workers without interpretation.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Current lifecycle status.
    pub status: RecordStatus,
    /// Number of times this record has been requeued after a failure.
    #[serde(default)]
    pub retry_count: u32,
    /// When the record was persisted.
    pub created_at: DateTime<Utc>,
}

impl ResponseRecord {
    /// Creates a pending record with the given payload.
    pub fn new(
        response_id: impl Into<String>,
        batch_id: impl Into<String>,
        agent_id: impl Into<String>,
        prompt: impl Into<String>,
        response_text: impl Into<String>,
    ) -> Self {
        Self {
            response_id: response_id.into(),
            batch_id: batch_id.into(),
            agent_id: agent_id.into(),
            prompt: prompt.into(),
            response_text: response_text.into(),
            context: None,
            reference: None,
            metadata: None,
            status: RecordStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Sets the conversation context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Sets the reference answer.
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Attaches opaque metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// The final, aggregated outcome for one record.
///
/// Written exactly once per `response_id`; the store enforces uniqueness and
/// the finaliser treats a conflict as "already finalised".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub response_id: String,
    pub batch_id: String,
    pub agent_id: String,
    /// Per-dimension scores. Errored dimensions appear with score 0.
    pub scores: BTreeMap<Dimension, f64>,
    /// Weighted final score in [0, 1].
    pub final_score: f64,
    /// One entry per dimension that failed to produce a usable score.
    pub processing_errors: Vec<String>,
    /// Wall-clock time from dispatch to finalisation.
    pub processing_time_ms: u64,
    pub processed_at: DateTime<Utc>,
}

/// Per-status record counts for a batch.
///
/// `pending` folds the `pending` and `queued` record statuses together, so the
/// counters always satisfy
/// `total = pending + processing + completed + failed + cancelled`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl BatchProgress {
    /// True when the counters add up to the total.
    pub fn is_consistent(&self) -> bool {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
            == self.total
    }

    /// True when no record can still transition: nothing pending or processing.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}
