//! Wire envelopes for tasks and results.
//!
//! Three envelopes travel through the broker:
//!
//! - `EvalTask`: pushed by the enqueue facade, popped by the dispatch loop.
//! - `DimensionTask`: the same envelope plus a `dimension` field, pushed by
//!   the dispatch loop and consumed by a dimension worker pool.
//! - `DimensionResult`: the scored reply a worker pushes onto the shared
//!   results queue.
//!
//! A task is one *attempt* at scoring a record: a retried record gets a fresh
//! `task_id`, so partial results from a dead attempt can never bleed into a
//! new one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dimension::Dimension;
use crate::record::ResponseRecord;

/// A main-queue task: one attempt at evaluating a single record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalTask {
    /// Fresh unique identifier for this attempt.
    pub task_id: String,
    /// The record under evaluation.
    pub response_id: String,
    pub batch_id: String,
    pub agent_id: String,
    pub prompt: String,
    pub response_text: String,
    /// Conversation context; empty when the record has none.
    #[serde(default)]
    pub context: String,
    /// Reference answer; empty when the record has none.
    #[serde(default)]
    pub reference: String,
    /// Opaque metadata copied through without interpretation.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Dimensions this task fans out to.
    pub dimensions: Vec<Dimension>,
    /// Retry count carried for observability; only the enqueue facade reads it.
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl EvalTask {
    /// Builds a fresh task (new `task_id`) from a persisted record.
    pub fn from_record(record: &ResponseRecord, retry_count: u32) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            response_id: record.response_id.clone(),
            batch_id: record.batch_id.clone(),
            agent_id: record.agent_id.clone(),
            prompt: record.prompt.clone(),
            response_text: record.response_text.clone(),
            context: record.context.clone().unwrap_or_default(),
            reference: record.reference.clone().unwrap_or_default(),
            metadata: record
                .metadata
                .clone()
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            dimensions: Dimension::ALL.to_vec(),
            retry_count,
            created_at: Utc::now(),
        }
    }

    /// Derives the per-dimension subtask for one worker pool.
    pub fn to_dimension_task(&self, dimension: Dimension) -> DimensionTask {
        DimensionTask {
            task: self.clone(),
            dimension,
        }
    }
}

/// A per-dimension work item: the task envelope plus the target dimension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DimensionTask {
    #[serde(flatten)]
    pub task: EvalTask,
    pub dimension: Dimension,
}

/// The scored reply a dimension worker pushes onto the results queue.
///
/// Either `score` is a usable number in [0, 1] and `error` is null, or the
/// worker failed and `error` explains why. Anything outside that contract is
/// treated as an errored dimension by the finaliser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionResult {
    pub task_id: String,
    pub dimension: Dimension,
    pub response_id: String,
    pub batch_id: String,
    pub agent_id: String,
    pub score: f64,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub processing_time_ms: u64,
    #[serde(default)]
    pub worker_id: String,
}

impl DimensionResult {
    /// True when the worker reported a failure for this dimension.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// True when the score is a finite number within [0, 1].
    pub fn has_valid_score(&self) -> bool {
        self.score.is_finite() && (0.0..=1.0).contains(&self.score)
    }
}
