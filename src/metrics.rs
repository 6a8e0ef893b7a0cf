//! Prometheus metrics registration and export.
//!
//! Metrics cover the three orchestrator loops: dispatched tasks, collected
//! results, finalisations by outcome, timeouts, in-flight depth, queue
//! depths, and the distribution of final scores. The recording helpers are
//! no-ops until `init_metrics` has run, so library users and tests that do
//! not care about metrics pay nothing.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all evalforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total tasks popped from the main queue and fanned out.
pub static TASKS_DISPATCHED: OnceLock<Counter> = OnceLock::new();

/// Total dimension results collected, labeled by dimension.
pub static RESULTS_COLLECTED: OnceLock<CounterVec> = OnceLock::new();

/// Total tasks finalised, labeled by outcome
/// (completed, failed, conflict).
pub static TASKS_FINALIZED: OnceLock<CounterVec> = OnceLock::new();

/// Total tasks failed by the timeout sweeper.
pub static TASKS_TIMED_OUT: OnceLock<Counter> = OnceLock::new();

/// Number of tasks currently in flight.
pub static TASKS_IN_FLIGHT: OnceLock<Gauge> = OnceLock::new();

/// Queue depths, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Distribution of final evaluation scores.
pub static FINAL_SCORE: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Idempotent: a second call leaves the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_dispatched = Counter::new(
        "evalforge_tasks_dispatched_total",
        "Total tasks popped from the main queue and fanned out",
    )?;

    let results_collected = CounterVec::new(
        Opts::new(
            "evalforge_results_collected_total",
            "Total dimension results collected",
        ),
        &["dimension"],
    )?;

    let tasks_finalized = CounterVec::new(
        Opts::new(
            "evalforge_tasks_finalized_total",
            "Total tasks finalised, by outcome",
        ),
        &["outcome"],
    )?;

    let tasks_timed_out = Counter::new(
        "evalforge_tasks_timed_out_total",
        "Total tasks failed by the timeout sweeper",
    )?;

    let tasks_in_flight = Gauge::new(
        "evalforge_tasks_in_flight",
        "Number of tasks currently in flight",
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("evalforge_queue_depth", "Queue depth"),
        &["queue_name"],
    )?;

    let final_score = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "evalforge_final_score",
            "Distribution of final evaluation scores",
        )
        .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
    )?;

    registry.register(Box::new(tasks_dispatched.clone()))?;
    registry.register(Box::new(results_collected.clone()))?;
    registry.register(Box::new(tasks_finalized.clone()))?;
    registry.register(Box::new(tasks_timed_out.clone()))?;
    registry.register(Box::new(tasks_in_flight.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(final_score.clone()))?;

    // A racing second init loses these sets; the first registration stays
    // live and its metrics keep counting.
    let _ = REGISTRY.set(registry);
    let _ = TASKS_DISPATCHED.set(tasks_dispatched);
    let _ = RESULTS_COLLECTED.set(results_collected);
    let _ = TASKS_FINALIZED.set(tasks_finalized);
    let _ = TASKS_TIMED_OUT.set(tasks_timed_out);
    let _ = TASKS_IN_FLIGHT.set(tasks_in_flight);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = FINAL_SCORE.set(final_score);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Always returns scrape-safe text: when the registry was never
/// initialized, or encoding fails, the output is a single comment line
/// instead of an error.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return String::from("# evalforge metrics disabled (init_metrics was never called)\n");
    };

    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# evalforge metrics unavailable: {}\n", e)),
        Err(e) => format!("# evalforge metrics unavailable: {}\n", e),
    }
}

/// Records a dispatched task.
pub fn record_dispatched() {
    if let Some(counter) = TASKS_DISPATCHED.get() {
        counter.inc();
    }
}

/// Records a collected dimension result.
pub fn record_result_collected(dimension: &str) {
    if let Some(counter) = RESULTS_COLLECTED.get() {
        counter.with_label_values(&[dimension]).inc();
    }
}

/// Records a finalisation outcome.
pub fn record_finalized(outcome: &str) {
    if let Some(counter) = TASKS_FINALIZED.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Records a task failed by the timeout sweeper.
pub fn record_timed_out() {
    if let Some(counter) = TASKS_TIMED_OUT.get() {
        counter.inc();
    }
}

/// Updates the in-flight gauge.
pub fn set_in_flight(count: usize) {
    if let Some(gauge) = TASKS_IN_FLIGHT.get() {
        gauge.set(count as f64);
    }
}

/// Updates the depth gauge for one queue.
pub fn set_queue_depth(queue_name: &str, depth: usize) {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.with_label_values(&[queue_name]).set(depth as f64);
    }
}

/// Records a final evaluation score.
pub fn observe_final_score(score: f64) {
    if let Some(histogram) = FINAL_SCORE.get() {
        histogram.observe(score);
    }
}
