//! Timeout sweeper.
//!
//! Bounds the wall-clock time a task can stay in flight. Every sweep
//! interval the sweeper fails any task older than the task timeout: the
//! record becomes `failed`, the partial-result hash is deleted, and the
//! in-flight entry is released. The sweeper never requeues; putting a failed
//! record back on the queue is an explicit operator action through the
//! enqueue facade.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::broker::{names, Broker};
use crate::config::OrchestratorConfig;
use crate::metrics;
use crate::progress::BatchProgressProjector;
use crate::record::RecordStatus;
use crate::store::Store;

use super::inflight::InFlightTable;

pub(crate) struct SweeperLoop {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) inflight: Arc<InFlightTable>,
    pub(crate) projector: BatchProgressProjector,
    pub(crate) config: OrchestratorConfig,
    pub(crate) shutdown_rx: broadcast::Receiver<()>,
}

impl SweeperLoop {
    /// Runs until a shutdown signal arrives.
    pub(crate) async fn run(mut self) {
        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            timeout_secs = self.config.task_timeout.as_secs(),
            "Timeout sweeper started"
        );

        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; consume it so sweeps start one
        // interval after startup.
        ticker.tick().await;
        self.publish_heartbeat().await;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    self.sweep_once().await;
                    self.publish_heartbeat().await;
                }
            }
        }

        info!("Timeout sweeper stopped");
    }

    /// Refreshes the heartbeat key other processes read the in-flight count
    /// from. The TTL spans a few sweep intervals so a dead orchestrator
    /// stops reporting soon after it stops sweeping.
    async fn publish_heartbeat(&self) {
        let snapshot = serde_json::json!({
            "in_flight": self.inflight.len(),
            "updated_at": chrono::Utc::now(),
        });
        if let Err(e) = self
            .broker
            .set_ex(
                names::ORCHESTRATOR_STATUS_KEY,
                &snapshot.to_string(),
                self.config.sweep_interval * 3,
            )
            .await
        {
            warn!(error = %e, "Failed to publish orchestrator heartbeat");
        }
    }

    /// Fails every in-flight task older than the task timeout. Returns the
    /// number of tasks swept.
    pub(crate) async fn sweep_once(&self) -> usize {
        let expired = self.inflight.expired(self.config.task_timeout);
        if expired.is_empty() {
            return 0;
        }

        let mut swept = 0;

        for (task_id, entry) in expired {
            warn!(
                task_id = %task_id,
                response_id = %entry.response_id,
                batch_id = %entry.batch_id,
                age_secs = entry.age().as_secs(),
                "Task exceeded deadline, failing record"
            );

            match self
                .store
                .mark_record_status(&entry.response_id, RecordStatus::Failed)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    // A racing finalisation settled the record first; just
                    // release the bookkeeping.
                    debug!(
                        task_id = %task_id,
                        response_id = %entry.response_id,
                        "Record already terminal"
                    );
                }
                Err(e) => {
                    error!(
                        task_id = %task_id,
                        response_id = %entry.response_id,
                        error = %e,
                        "Failed to fail timed-out record, retrying next sweep"
                    );
                    continue;
                }
            }

            if let Err(e) = self.broker.del(&names::partial_results_key(&task_id)).await {
                warn!(task_id = %task_id, error = %e, "Failed to delete partial results");
            }

            self.inflight.remove(&task_id);
            metrics::record_timed_out();
            metrics::set_in_flight(self.inflight.len());

            if let Err(e) = self.projector.refresh(&entry.batch_id).await {
                warn!(batch_id = %entry.batch_id, error = %e, "Progress refresh failed");
            }

            swept += 1;
        }

        if swept > 0 {
            info!(swept, "Sweep failed timed-out tasks");
        }

        swept
    }
}
