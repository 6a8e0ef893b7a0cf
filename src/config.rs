//! Orchestrator configuration.
//!
//! This module provides configuration for the scheduling engine: concurrency
//! and retry limits, timeouts, polling cadence, broker/store endpoints, and
//! the per-dimension aggregation weights.

use std::time::Duration;

use thiserror::Error;

use crate::dimension::Dimension;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Aggregation weight per dimension.
///
/// The five weights must be non-negative and sum to 1 (within 1e-6). The
/// finaliser renormalises over the dimensions that actually scored, so the
/// weights describe relative importance, not absolute contributions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DimensionWeights {
    pub instruction: f64,
    pub hallucination: f64,
    pub assumption: f64,
    pub coherence: f64,
    pub accuracy: f64,
}

impl Default for DimensionWeights {
    fn default() -> Self {
        Self {
            instruction: 0.20,
            hallucination: 0.25,
            assumption: 0.20,
            coherence: 0.15,
            accuracy: 0.20,
        }
    }
}

impl DimensionWeights {
    /// Returns the weight for one dimension.
    pub fn weight(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Instruction => self.instruction,
            Dimension::Hallucination => self.hallucination,
            Dimension::Assumption => self.assumption,
            Dimension::Coherence => self.coherence,
            Dimension::Accuracy => self.accuracy,
        }
    }

    /// Validates that every weight is non-negative and the sum is 1.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for dimension in Dimension::ALL {
            if self.weight(dimension) < 0.0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "weight for {} must be non-negative",
                    dimension
                )));
            }
        }

        let sum: f64 = Dimension::ALL.iter().map(|d| self.weight(*d)).sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::ValidationFailed(format!(
                "dimension weights must sum to 1.0, got {}",
                sum
            )));
        }

        Ok(())
    }
}

/// Configuration for the master orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Concurrency and retry limits
    /// Maximum number of tasks in flight at once (dispatch backpressure cap).
    pub max_concurrent_tasks: usize,
    /// Task-level retry ceiling enforced by the enqueue facade.
    pub max_retries: u32,

    // Deadlines and cadence
    /// Per-task deadline enforced by the timeout sweeper.
    pub task_timeout: Duration,
    /// How often the timeout sweeper scans the in-flight table.
    pub sweep_interval: Duration,
    /// TTL on the per-task partial-result hash.
    pub partial_results_ttl: Duration,
    /// TTL on batch progress snapshots.
    pub progress_snapshot_ttl: Duration,
    /// Simulated-blocking window for results-queue pops.
    pub results_pop_timeout: Duration,
    /// Simulated-blocking window for main-queue pops.
    pub main_pop_timeout: Duration,
    /// Polling cadence inside a simulated-blocking pop.
    pub poll_interval: Duration,
    /// Backoff when the dispatch loop is at capacity or hits an error.
    pub dispatch_backoff: Duration,
    /// How long graceful shutdown waits for the loops before giving up.
    pub hard_shutdown_deadline: Duration,

    // Endpoints
    /// Redis connection URL for the queue broker.
    pub redis_url: String,
    /// PostgreSQL connection URL for the store.
    pub database_url: String,

    // Aggregation
    /// Per-dimension weights used by the finaliser.
    pub weights: DimensionWeights,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            max_retries: 3,
            task_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            partial_results_ttl: Duration::from_secs(3600),
            progress_snapshot_ttl: Duration::from_secs(86400),
            results_pop_timeout: Duration::from_secs(1),
            main_pop_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            dispatch_backoff: Duration::from_secs(1),
            hard_shutdown_deadline: Duration::from_secs(30),
            redis_url: "redis://localhost:6379".to_string(),
            database_url: "postgres://localhost/evalforge".to_string(),
            weights: DimensionWeights::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `EVALFORGE_MAX_CONCURRENT_TASKS`: dispatch concurrency cap (default: 10)
    /// - `EVALFORGE_MAX_RETRIES`: task-level retry ceiling (default: 3)
    /// - `EVALFORGE_TASK_TIMEOUT_SECS`: per-task deadline (default: 300)
    /// - `EVALFORGE_SWEEP_INTERVAL_SECS`: sweeper cadence (default: 60)
    /// - `EVALFORGE_PARTIAL_RESULTS_TTL_SECS`: partial-result hash TTL (default: 3600)
    /// - `EVALFORGE_RESULTS_POP_TIMEOUT_SECS`: results pop window (default: 1)
    /// - `EVALFORGE_MAIN_POP_TIMEOUT_SECS`: main pop window (default: 5)
    /// - `EVALFORGE_HARD_SHUTDOWN_DEADLINE_SECS`: shutdown grace (default: 30)
    /// - `EVALFORGE_WEIGHT_{INSTRUCTION,HALLUCINATION,ASSUMPTION,COHERENCE,ACCURACY}`:
    ///   per-dimension weight overrides; the five must still sum to 1
    /// - `REDIS_URL`: broker URL (default: redis://localhost:6379)
    /// - `DATABASE_URL`: store URL (required)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("EVALFORGE_MAX_CONCURRENT_TASKS") {
            config.max_concurrent_tasks = parse_env_value(&val, "EVALFORGE_MAX_CONCURRENT_TASKS")?;
        }

        if let Ok(val) = std::env::var("EVALFORGE_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "EVALFORGE_MAX_RETRIES")?;
        }

        if let Ok(val) = std::env::var("EVALFORGE_TASK_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "EVALFORGE_TASK_TIMEOUT_SECS")?;
            config.task_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("EVALFORGE_SWEEP_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "EVALFORGE_SWEEP_INTERVAL_SECS")?;
            config.sweep_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("EVALFORGE_PARTIAL_RESULTS_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "EVALFORGE_PARTIAL_RESULTS_TTL_SECS")?;
            config.partial_results_ttl = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("EVALFORGE_RESULTS_POP_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "EVALFORGE_RESULTS_POP_TIMEOUT_SECS")?;
            config.results_pop_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("EVALFORGE_MAIN_POP_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "EVALFORGE_MAIN_POP_TIMEOUT_SECS")?;
            config.main_pop_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("EVALFORGE_HARD_SHUTDOWN_DEADLINE_SECS") {
            let secs: u64 = parse_env_value(&val, "EVALFORGE_HARD_SHUTDOWN_DEADLINE_SECS")?;
            config.hard_shutdown_deadline = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("EVALFORGE_WEIGHT_INSTRUCTION") {
            config.weights.instruction = parse_env_value(&val, "EVALFORGE_WEIGHT_INSTRUCTION")?;
        }
        if let Ok(val) = std::env::var("EVALFORGE_WEIGHT_HALLUCINATION") {
            config.weights.hallucination = parse_env_value(&val, "EVALFORGE_WEIGHT_HALLUCINATION")?;
        }
        if let Ok(val) = std::env::var("EVALFORGE_WEIGHT_ASSUMPTION") {
            config.weights.assumption = parse_env_value(&val, "EVALFORGE_WEIGHT_ASSUMPTION")?;
        }
        if let Ok(val) = std::env::var("EVALFORGE_WEIGHT_COHERENCE") {
            config.weights.coherence = parse_env_value(&val, "EVALFORGE_WEIGHT_COHERENCE")?;
        }
        if let Ok(val) = std::env::var("EVALFORGE_WEIGHT_ACCURACY") {
            config.weights.accuracy = parse_env_value(&val, "EVALFORGE_WEIGHT_ACCURACY")?;
        }

        if let Ok(val) = std::env::var("REDIS_URL") {
            config.redis_url = val;
        }

        config.database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_tasks must be greater than 0".to_string(),
            ));
        }

        if self.task_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "task_timeout must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "sweep_interval must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        self.weights.validate()?;

        Ok(())
    }

    /// Builder method to set the concurrency cap.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Builder method to set the retry ceiling.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Builder method to set the per-task deadline.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Builder method to set the sweeper cadence.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Builder method to set the partial-result hash TTL.
    pub fn with_partial_results_ttl(mut self, ttl: Duration) -> Self {
        self.partial_results_ttl = ttl;
        self
    }

    /// Builder method to set the results pop window.
    pub fn with_results_pop_timeout(mut self, timeout: Duration) -> Self {
        self.results_pop_timeout = timeout;
        self
    }

    /// Builder method to set the main pop window.
    pub fn with_main_pop_timeout(mut self, timeout: Duration) -> Self {
        self.main_pop_timeout = timeout;
        self
    }

    /// Builder method to set the polling cadence.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the dispatch backoff.
    pub fn with_dispatch_backoff(mut self, backoff: Duration) -> Self {
        self.dispatch_backoff = backoff;
        self
    }

    /// Builder method to set the shutdown grace period.
    pub fn with_hard_shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.hard_shutdown_deadline = deadline;
        self
    }

    /// Builder method to set the broker URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the store URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the aggregation weights.
    pub fn with_weights(mut self, weights: DimensionWeights) -> Self {
        self.weights = weights;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
