//! Worker pool configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_ratio, validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

const MIB: usize = 1024 * 1024;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Global cap on live plus in-creation contexts across all categories
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Per-task deadline measured from dispatch
    #[serde(
        with = "crate::domains::utils::serde_duration_ms",
        default = "default_worker_task_timeout"
    )]
    pub worker_task_timeout: Duration,

    /// Run tasks inline when no context can take them
    #[serde(default = "crate::domains::utils::default_true")]
    pub fallback_to_main_thread: bool,

    /// Let the sizing controller grow and shrink categories
    #[serde(default = "crate::domains::utils::default_true")]
    pub auto_adjust_pool: bool,

    /// Period of liveness probes and sizing decisions
    #[serde(
        with = "crate::domains::utils::serde_duration_ms",
        default = "default_health_check_interval"
    )]
    pub health_check_interval: Duration,

    /// Backlog per context above which a category grows
    #[serde(default = "default_pool_expansion_threshold")]
    pub pool_expansion_threshold: f64,

    /// Payloads above this size (bytes) use segmented transfer
    #[serde(default = "default_max_data_transfer_size")]
    pub max_data_transfer_size: usize,

    /// Upper bound on a single transfer segment (bytes)
    #[serde(default = "default_transfer_chunk_size")]
    pub transfer_chunk_size: usize,

    /// Time a new context has to answer its first probe
    #[serde(
        with = "crate::domains::utils::serde_duration_ms",
        default = "default_readiness_timeout"
    )]
    pub readiness_timeout: Duration,

    /// Time in-flight work may take to drain during shutdown
    #[serde(
        with = "crate::domains::utils::serde_duration_ms",
        default = "default_shutdown_grace_period"
    )]
    pub shutdown_grace_period: Duration,

    /// Time contexts have to acknowledge a terminate notice
    #[serde(
        with = "crate::domains::utils::serde_duration_ms",
        default = "default_terminate_ack_timeout"
    )]
    pub terminate_ack_timeout: Duration,

    /// Consecutive timeouts or missed probes before a restart
    #[serde(default = "default_unresponsive_threshold")]
    pub unresponsive_threshold: u32,

    /// Recorded faults before a context is marked as errored and restarted
    #[serde(default = "default_error_restart_threshold")]
    pub error_restart_threshold: u32,

    /// Consecutive creation failures that open the creation breaker
    #[serde(default = "default_max_creation_failures")]
    pub max_creation_failures: u32,

    /// Time the creation breaker stays open
    #[serde(
        with = "crate::domains::utils::serde_duration_ms",
        default = "default_creation_retry_cooldown"
    )]
    pub creation_retry_cooldown: Duration,

    /// Re-dispatch attempts for a task whose context was lost
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,

    /// Memory usage ratio at which idle contexts are retired
    #[serde(default = "default_pressure_threshold")]
    pub high_memory_threshold: f64,

    /// CPU usage ratio above which categories do not grow
    #[serde(default = "default_pressure_threshold")]
    pub high_cpu_threshold: f64,

    /// Per-category pool layout
    #[serde(default = "default_categories")]
    pub categories: Vec<CategoryPoolConfig>,
}

/// Pool layout of a single category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPoolConfig {
    pub name: String,

    /// Baseline size created at start and kept when idle
    pub pool_size: usize,

    /// Hard cap for the category
    pub max_pool_size: usize,

    /// How contexts of this category are launched
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

/// How an execution context is started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BootstrapConfig {
    /// Dedicated OS thread inside this process
    #[default]
    InProcess,
    /// Child process speaking the line protocol on stdin/stdout
    Process {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl CategoryPoolConfig {
    pub fn new(name: impl Into<String>, pool_size: usize, max_pool_size: usize) -> Self {
        Self {
            name: name.into(),
            pool_size,
            max_pool_size,
            bootstrap: BootstrapConfig::InProcess,
        }
    }

    pub fn with_bootstrap(mut self, bootstrap: BootstrapConfig) -> Self {
        self.bootstrap = bootstrap;
        self
    }
}

impl PoolConfig {
    /// Look up the layout of a category
    pub fn category(&self, name: &str) -> Option<&CategoryPoolConfig> {
        self.categories.iter().find(|c| c.name == name)
    }

    /// Sum of baseline sizes across categories
    pub fn baseline_total(&self) -> usize {
        self.categories.iter().map(|c| c.pool_size).sum()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            worker_task_timeout: default_worker_task_timeout(),
            fallback_to_main_thread: true,
            auto_adjust_pool: true,
            health_check_interval: default_health_check_interval(),
            pool_expansion_threshold: default_pool_expansion_threshold(),
            max_data_transfer_size: default_max_data_transfer_size(),
            transfer_chunk_size: default_transfer_chunk_size(),
            readiness_timeout: default_readiness_timeout(),
            shutdown_grace_period: default_shutdown_grace_period(),
            terminate_ack_timeout: default_terminate_ack_timeout(),
            unresponsive_threshold: default_unresponsive_threshold(),
            error_restart_threshold: default_error_restart_threshold(),
            max_creation_failures: default_max_creation_failures(),
            creation_retry_cooldown: default_creation_retry_cooldown(),
            max_task_retries: default_max_task_retries(),
            high_memory_threshold: default_pressure_threshold(),
            high_cpu_threshold: default_pressure_threshold(),
            categories: default_categories(),
        }
    }
}

impl Validatable for PoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        let domain = self.domain_name();

        validate_positive(self.max_workers, "max_workers", domain)?;
        validate_positive(
            self.worker_task_timeout.as_millis(),
            "worker_task_timeout",
            domain,
        )?;
        validate_positive(
            self.health_check_interval.as_millis(),
            "health_check_interval",
            domain,
        )?;
        validate_positive(
            self.readiness_timeout.as_millis(),
            "readiness_timeout",
            domain,
        )?;
        validate_positive(
            self.terminate_ack_timeout.as_millis(),
            "terminate_ack_timeout",
            domain,
        )?;
        validate_positive(
            self.pool_expansion_threshold,
            "pool_expansion_threshold",
            domain,
        )?;
        validate_positive(self.max_data_transfer_size, "max_data_transfer_size", domain)?;
        validate_positive(self.transfer_chunk_size, "transfer_chunk_size", domain)?;
        validate_positive(self.unresponsive_threshold, "unresponsive_threshold", domain)?;
        validate_positive(self.error_restart_threshold, "error_restart_threshold", domain)?;
        validate_positive(self.max_creation_failures, "max_creation_failures", domain)?;
        validate_ratio(self.high_memory_threshold, "high_memory_threshold", domain)?;
        validate_ratio(self.high_cpu_threshold, "high_cpu_threshold", domain)?;

        if self.transfer_chunk_size > self.max_data_transfer_size {
            return Err(self.validation_error(format!(
                "transfer_chunk_size ({}) cannot exceed max_data_transfer_size ({})",
                self.transfer_chunk_size, self.max_data_transfer_size
            )));
        }

        if self.categories.is_empty() {
            return Err(self.validation_error("At least one category must be configured"));
        }

        let mut seen = HashSet::new();
        for category in &self.categories {
            category.validate()?;
            if !seen.insert(category.name.as_str()) {
                return Err(self.validation_error(format!(
                    "Duplicate category name '{}'",
                    category.name
                )));
            }
        }

        if self.baseline_total() > self.max_workers {
            log::warn!(
                "Baseline pool sizes ({}) exceed max_workers ({}); some categories start below baseline",
                self.baseline_total(),
                self.max_workers
            );
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "pool"
    }
}

impl Validatable for CategoryPoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        let domain = self.domain_name();
        validate_required_string(&self.name, "name", domain)?;
        validate_positive(self.pool_size, "pool_size", domain)?;
        validate_positive(self.max_pool_size, "max_pool_size", domain)?;

        if self.pool_size > self.max_pool_size {
            return Err(self.validation_error(format!(
                "Category '{}' pool_size ({}) exceeds max_pool_size ({})",
                self.name, self.pool_size, self.max_pool_size
            )));
        }

        if let BootstrapConfig::Process { program, .. } = &self.bootstrap {
            validate_required_string(program, "bootstrap.program", domain)?;
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "pool.category"
    }
}

// Default value functions
fn default_max_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(2)
}

fn default_worker_task_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_pool_expansion_threshold() -> f64 {
    3.0
}

fn default_max_data_transfer_size() -> usize {
    50 * MIB
}

fn default_transfer_chunk_size() -> usize {
    10 * MIB
}

fn default_readiness_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_shutdown_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_terminate_ack_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_unresponsive_threshold() -> u32 {
    3
}

fn default_error_restart_threshold() -> u32 {
    3
}

fn default_max_creation_failures() -> u32 {
    3
}

fn default_creation_retry_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_max_task_retries() -> u32 {
    1
}

fn default_pressure_threshold() -> f64 {
    0.9
}

fn default_categories() -> Vec<CategoryPoolConfig> {
    vec![
        CategoryPoolConfig::new("chunk", 2, 4),
        CategoryPoolConfig::new("hash", 2, default_max_workers()),
        CategoryPoolConfig::new("default", 1, 2),
    ]
}
