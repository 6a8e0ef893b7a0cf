//! Master orchestrator.
//!
//! A single logical process running three cooperating activities:
//!
//! 1. *Dispatch loop*: pops tasks from the main queue and fans each one out
//!    to the five dimension queues under a concurrency cap.
//! 2. *Collector loop*: pops scored results, reassembles them per task, and
//!    finalises complete tasks idempotently.
//! 3. *Timeout sweeper*: fails tasks that outlive their deadline.
//!
//! All cross-process state lives in the broker and the store; the
//! orchestrator holds only the in-flight table (a rebuildable deadline
//! accelerator) and loop-local state. Collaborator handles are passed in at
//! construction; nothing is ambient.

mod collector;
mod dispatch;
pub mod inflight;
mod sweeper;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::{names, Broker, BrokerError};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::dimension::Dimension;
use crate::metrics;
use crate::progress::BatchProgressProjector;
use crate::store::{Store, StoreError};
use crate::task::DimensionResult;

pub use inflight::{InFlightEntry, InFlightTable};

use collector::CollectorLoop;
use dispatch::DispatchLoop;
use sweeper::SweeperLoop;

/// Errors that can occur in the orchestrator lifecycle.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The orchestrator is already running.
    #[error("Orchestrator is already running")]
    AlreadyRunning,

    /// The orchestrator is not running.
    #[error("Orchestrator is not running")]
    NotRunning,

    /// Graceful shutdown exceeded the hard deadline.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Broker error.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// The master orchestrator: owns the three loops and their shared state.
pub struct Orchestrator {
    config: OrchestratorConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn Store>,
    inflight: Arc<InFlightTable>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    is_running: AtomicBool,
}

impl Orchestrator {
    /// Creates an orchestrator over the given collaborators.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Config` when the configuration is invalid.
    pub fn new(
        config: OrchestratorConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn Store>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            broker,
            store,
            inflight: Arc::new(InFlightTable::new()),
            shutdown_tx,
            handles: Vec::new(),
            is_running: AtomicBool::new(false),
        })
    }

    fn projector(&self) -> BatchProgressProjector {
        BatchProgressProjector::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.store),
            self.config.progress_snapshot_ttl,
        )
    }

    /// Starts the dispatch loop, collector loop, and timeout sweeper.
    ///
    /// Before the loops start, the in-flight table is rebuilt from any
    /// partial-result hashes left over by a previous run, so their tasks get
    /// one more full deadline window instead of leaking forever.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::AlreadyRunning` when the loops are up.
    pub async fn start(&mut self) -> Result<(), OrchestratorError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyRunning);
        }

        match self.rebuild_inflight().await {
            Ok(0) => {}
            Ok(rebuilt) => info!(rebuilt, "Rebuilt in-flight entries from partial results"),
            Err(e) => warn!(error = %e, "Failed to rebuild in-flight table"),
        }

        let dispatch = DispatchLoop {
            broker: Arc::clone(&self.broker),
            store: Arc::clone(&self.store),
            inflight: Arc::clone(&self.inflight),
            projector: self.projector(),
            config: self.config.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        let collector = CollectorLoop {
            broker: Arc::clone(&self.broker),
            store: Arc::clone(&self.store),
            inflight: Arc::clone(&self.inflight),
            projector: self.projector(),
            config: self.config.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        let sweeper = SweeperLoop {
            broker: Arc::clone(&self.broker),
            store: Arc::clone(&self.store),
            inflight: Arc::clone(&self.inflight),
            projector: self.projector(),
            config: self.config.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };

        self.handles.push(tokio::spawn(dispatch.run()));
        self.handles.push(tokio::spawn(collector.run()));
        self.handles.push(tokio::spawn(sweeper.run()));

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            task_timeout_secs = self.config.task_timeout.as_secs(),
            "Orchestrator started"
        );

        Ok(())
    }

    /// Initiates graceful shutdown: the loops stop popping, in-flight work
    /// settles, and after the hard deadline any remaining loop is aborted
    /// (next-start recovery picks up whatever was left).
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::NotRunning` when the loops are down, or
    /// `ShutdownTimeout` when the hard deadline expired.
    pub async fn stop(&mut self) -> Result<(), OrchestratorError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(OrchestratorError::NotRunning);
        }

        info!("Initiating orchestrator shutdown");

        // Ignore send error - the loops may have already stopped
        let _ = self.shutdown_tx.send(());

        let mut handles = std::mem::take(&mut self.handles);
        let drain = async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Loop task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(self.config.hard_shutdown_deadline, drain).await {
            Ok(()) => {
                self.is_running.store(false, Ordering::SeqCst);
                info!("Orchestrator shutdown complete");
                Ok(())
            }
            Err(_) => {
                for handle in &handles {
                    handle.abort();
                }
                self.is_running.store(false, Ordering::SeqCst);
                Err(OrchestratorError::ShutdownTimeout(
                    self.config.hard_shutdown_deadline,
                ))
            }
        }
    }

    /// Rebuilds the in-flight table by scanning partial-result hashes.
    ///
    /// Rebuilt entries get a fresh start time: after a restart every orphaned
    /// task is granted one more full deadline window before the sweeper may
    /// fail it.
    async fn rebuild_inflight(&self) -> Result<usize, BrokerError> {
        let keys = self
            .broker
            .scan_keys(names::PARTIAL_RESULTS_PATTERN)
            .await?;

        let mut rebuilt = 0;
        for key in keys {
            let Some(task_id) = names::task_id_from_partial_key(&key) else {
                continue;
            };
            if self.inflight.get(task_id).is_some() {
                continue;
            }

            let fields = self.broker.hash_get_all(&key).await?;
            let Some(result) = fields
                .values()
                .find_map(|v| serde_json::from_str::<DimensionResult>(v).ok())
            else {
                continue;
            };
            if result.response_id.is_empty() {
                continue;
            }

            self.inflight.insert(
                task_id,
                InFlightEntry::new(&result.response_id, &result.batch_id),
            );
            rebuilt += 1;
        }

        metrics::set_in_flight(self.inflight.len());
        Ok(rebuilt)
    }

    /// Whether the loops are currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Number of tasks currently in flight.
    pub fn in_flight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Gathers a queue-side status report.
    pub async fn status(&self) -> Result<StatusReport, BrokerError> {
        StatusReport::gather(self.broker.as_ref()).await
    }
}

/// Sets the broker control key so a running orchestrator drains and exits.
pub async fn request_shutdown(broker: &dyn Broker) -> Result<(), BrokerError> {
    broker
        .set_ex(names::CONTROL_KEY, "shutdown", Duration::from_secs(60))
        .await
}

/// Whether a shutdown has been requested through the broker control key.
pub async fn shutdown_requested(broker: &dyn Broker) -> Result<bool, BrokerError> {
    Ok(broker.get(names::CONTROL_KEY).await?.as_deref() == Some("shutdown"))
}

/// Clears a pending shutdown request.
pub async fn clear_shutdown_request(broker: &dyn Broker) -> Result<(), BrokerError> {
    broker.del(names::CONTROL_KEY).await
}

/// Queue-side view of the system, for the `status` command.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Depth of the main task queue.
    pub main_queue: usize,
    /// Depth of each dimension queue.
    pub dimension_queues: BTreeMap<String, usize>,
    /// Depth of the shared results queue.
    pub results_queue: usize,
    /// In-flight count reported by a running orchestrator's heartbeat, if
    /// one is alive.
    pub in_flight: Option<u64>,
    /// Latest batch progress snapshots.
    pub batches: Vec<serde_json::Value>,
    /// Workers with a live heartbeat key.
    pub live_workers: Vec<String>,
}

impl StatusReport {
    /// Reads queue depths, batch snapshots, and worker liveness from the
    /// broker.
    pub async fn gather(broker: &dyn Broker) -> Result<Self, BrokerError> {
        let main_queue = broker.len(names::MAIN_QUEUE).await?;
        metrics::set_queue_depth(names::MAIN_QUEUE, main_queue);

        let mut dimension_queues = BTreeMap::new();
        for dimension in Dimension::ALL {
            let queue = names::dimension_queue(dimension);
            let depth = broker.len(&queue).await?;
            metrics::set_queue_depth(&queue, depth);
            dimension_queues.insert(queue, depth);
        }

        let results_queue = broker.len(names::RESULTS_QUEUE).await?;
        metrics::set_queue_depth(names::RESULTS_QUEUE, results_queue);

        let in_flight = broker
            .get(names::ORCHESTRATOR_STATUS_KEY)
            .await?
            .and_then(|snapshot| serde_json::from_str::<serde_json::Value>(&snapshot).ok())
            .and_then(|snapshot| snapshot["in_flight"].as_u64());

        let batch_keys = broker.scan_keys(names::BATCH_PROGRESS_PATTERN).await?;
        let batches = broker
            .mget(&batch_keys)
            .await?
            .into_iter()
            .flatten()
            .filter_map(|snapshot| serde_json::from_str(&snapshot).ok())
            .collect();

        let live_workers = broker
            .scan_keys(names::WORKER_STATUS_PATTERN)
            .await?
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix("worker:")
                    .and_then(|rest| rest.strip_suffix(":status"))
                    .map(str::to_string)
            })
            .collect();

        Ok(Self {
            main_queue,
            dimension_queues,
            results_queue,
            in_flight,
            batches,
            live_workers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::store::InMemoryStore;

    fn quick_config() -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_poll_interval(Duration::from_millis(5))
            .with_main_pop_timeout(Duration::from_millis(20))
            .with_results_pop_timeout(Duration::from_millis(20))
            .with_dispatch_backoff(Duration::from_millis(10))
            .with_hard_shutdown_deadline(Duration::from_secs(2))
    }

    fn orchestrator() -> (Arc<InMemoryBroker>, Orchestrator) {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = Orchestrator::new(
            quick_config(),
            Arc::clone(&broker) as Arc<dyn Broker>,
            store as Arc<dyn Store>,
        )
        .expect("valid config");
        (broker, orchestrator)
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (_broker, mut orchestrator) = orchestrator();

        assert!(!orchestrator.is_running());
        orchestrator.start().await.expect("start");
        assert!(orchestrator.is_running());

        assert!(matches!(
            orchestrator.start().await,
            Err(OrchestratorError::AlreadyRunning)
        ));

        orchestrator.stop().await.expect("stop");
        assert!(!orchestrator.is_running());

        assert!(matches!(
            orchestrator.stop().await,
            Err(OrchestratorError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_rebuild_inflight_from_partial_hashes() {
        let (broker, orchestrator) = orchestrator();

        let result = DimensionResult {
            task_id: "t-orphan".to_string(),
            dimension: Dimension::Accuracy,
            response_id: "r-1".to_string(),
            batch_id: "b-1".to_string(),
            agent_id: "agent-a".to_string(),
            score: 0.5,
            details: serde_json::Value::Null,
            error: None,
            processing_time_ms: 10,
            worker_id: "w-1".to_string(),
        };
        broker
            .hash_set(
                &names::partial_results_key("t-orphan"),
                "accuracy",
                &serde_json::to_string(&result).expect("serialize"),
            )
            .await
            .expect("hset");

        let rebuilt = orchestrator.rebuild_inflight().await.expect("rebuild");
        assert_eq!(rebuilt, 1);

        let entry = orchestrator.inflight.get("t-orphan").expect("entry");
        assert_eq!(entry.response_id, "r-1");
        assert_eq!(entry.batch_id, "b-1");
        // Fresh start time: far from expired.
        assert!(entry.age() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_shutdown_control_key_roundtrip() {
        let broker = InMemoryBroker::new();

        assert!(!shutdown_requested(&broker).await.expect("check"));
        request_shutdown(&broker).await.expect("request");
        assert!(shutdown_requested(&broker).await.expect("check"));
        clear_shutdown_request(&broker).await.expect("clear");
        assert!(!shutdown_requested(&broker).await.expect("check"));
    }

    #[tokio::test]
    async fn test_status_report_gather() {
        let broker = InMemoryBroker::new();

        broker
            .append(names::MAIN_QUEUE, "{}")
            .await
            .expect("append");
        broker
            .append(&names::dimension_queue(Dimension::Coherence), "{}")
            .await
            .expect("append");
        broker
            .set_ex(
                &names::batch_progress_key("b-1"),
                r#"{"batch_id":"b-1","status":"processing"}"#,
                Duration::from_secs(60),
            )
            .await
            .expect("set");
        broker
            .set_ex(
                &names::worker_status_key("w-7"),
                "alive",
                Duration::from_secs(60),
            )
            .await
            .expect("set");

        let report = StatusReport::gather(&broker).await.expect("gather");

        assert_eq!(report.main_queue, 1);
        assert_eq!(report.results_queue, 0);
        assert_eq!(
            report.dimension_queues["dimension_queue:coherence"], 1
        );
        assert_eq!(report.batches.len(), 1);
        assert_eq!(report.live_workers, vec!["w-7"]);
        // No orchestrator heartbeat was published.
        assert_eq!(report.in_flight, None);

        broker
            .set_ex(
                names::ORCHESTRATOR_STATUS_KEY,
                r#"{"in_flight":4}"#,
                Duration::from_secs(60),
            )
            .await
            .expect("set");
        let report = StatusReport::gather(&broker).await.expect("gather");
        assert_eq!(report.in_flight, Some(4));
    }
}
