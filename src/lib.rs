//! evalforge: scheduling and aggregation engine for multi-dimension
//! evaluation of AI agent responses.
//!
//! Batches of prompt/response records are fanned out to five per-dimension
//! scoring queues (instruction, hallucination, assumption, coherence,
//! accuracy); the orchestrator collects the returning partial scores,
//! enforces per-task deadlines, and materialises one weighted evaluation per
//! record, idempotently, at least once.

// Core modules
pub mod broker;
pub mod cli;
pub mod config;
pub mod dimension;
pub mod enqueue;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod record;
pub mod scoring;
pub mod store;
pub mod task;

// Re-export commonly used types
pub use broker::{Broker, BrokerError, InMemoryBroker, RedisBroker};
pub use config::{ConfigError, DimensionWeights, OrchestratorConfig};
pub use dimension::Dimension;
pub use enqueue::{EnqueueError, EnqueueFacade, RequeueOutcome};
pub use orchestrator::{Orchestrator, OrchestratorError, StatusReport};
pub use record::{BatchProgress, BatchStatus, Evaluation, RecordStatus, ResponseRecord};
pub use store::{InMemoryStore, PostgresStore, Store, StoreError};
pub use task::{DimensionResult, DimensionTask, EvalTask};
