//! Status and shutdown reports

use chunkflow_resilience::{CircuitState, ShutdownPhase};
use serde::Serialize;

use crate::context::ContextSnapshot;

#[derive(Debug, Clone, Serialize)]
pub struct CategoryStatus {
    pub name: String,
    /// Size the sizing controller currently aims for
    pub target_size: usize,
    pub live: usize,
    pub creating: usize,
    pub idle: usize,
    pub busy: usize,
    pub queued: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub phase: ShutdownPhase,
    pub contexts: Vec<ContextSnapshot>,
    pub categories: Vec<CategoryStatus>,
    /// Queued, in flight and fallback tasks
    pub active_tasks: usize,
    pub in_flight: usize,
    pub fallback_running: usize,
    /// Timeout timers that have not been cleared
    pub live_timers: usize,
    pub creation_breaker: CircuitState,
}

impl PoolStatus {
    pub fn category(&self, name: &str) -> Option<&CategoryStatus> {
        self.categories.iter().find(|c| c.name == name)
    }

    pub fn queued(&self) -> usize {
        self.categories.iter().map(|c| c.queued).sum()
    }
}

/// Outcome of [`crate::PoolManager::terminate`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Whether all work finished inside the grace period
    pub drained: bool,
    pub cancelled_tasks: usize,
    pub contexts_acknowledged: usize,
    pub contexts_forced: usize,
}
