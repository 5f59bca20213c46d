//! Circuit breaker pattern implementation
//!
//! The breaker is owned by a single task, so it takes `&mut self` and carries
//! no locking of its own.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests are blocked
    Open,
    /// Circuit is half-open, a trial request is allowed to test recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Successes in half-open state before closing
    pub success_threshold: u32,

    /// Time to wait before transitioning from open to half-open
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, Default)]
pub struct CircuitMetrics {
    pub total_successes: u64,
    pub total_failures: u64,
    /// Requests refused while open
    pub total_rejected: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_time: Option<Instant>,
    pub last_state_change: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    opened_at: Option<Instant>,
    metrics: CircuitMetrics,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            opened_at: None,
            metrics: CircuitMetrics::default(),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Get the current state
    pub fn state(&mut self) -> CircuitState {
        self.update_state();
        self.state
    }

    /// Check whether a request may proceed, counting a rejection if not
    pub fn allow_request(&mut self) -> bool {
        self.update_state();
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                self.metrics.total_rejected += 1;
                false
            }
        }
    }

    /// Record a successful operation
    pub fn record_success(&mut self) {
        self.update_state();
        self.metrics.total_successes += 1;
        self.metrics.consecutive_failures = 0;

        match self.state {
            CircuitState::HalfOpen => {
                self.metrics.consecutive_successes += 1;
                if self.metrics.consecutive_successes >= self.config.success_threshold {
                    self.transition(CircuitState::Closed);
                }
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    /// Record a failed operation
    pub fn record_failure(&mut self) {
        self.update_state();
        let now = Instant::now();
        self.metrics.total_failures += 1;
        self.metrics.consecutive_failures += 1;
        self.metrics.last_failure_time = Some(now);

        match self.state {
            CircuitState::Closed => {
                if self.metrics.consecutive_failures >= self.config.failure_threshold {
                    self.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.metrics.consecutive_successes = 0;
                self.transition(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    pub fn metrics(&self) -> &CircuitMetrics {
        &self.metrics
    }

    /// Force the circuit back to closed
    pub fn reset(&mut self) {
        self.metrics.consecutive_failures = 0;
        self.metrics.consecutive_successes = 0;
        self.transition(CircuitState::Closed);
    }

    fn update_state(&mut self) {
        if self.state == CircuitState::Open {
            let cooled_down = self
                .opened_at
                .map(|at| at.elapsed() >= self.config.cooldown)
                .unwrap_or(true);
            if cooled_down {
                self.transition(CircuitState::HalfOpen);
            }
        }
    }

    fn transition(&mut self, next: CircuitState) {
        if self.state == next {
            return;
        }
        log::debug!("Circuit breaker {} -> {}", self.state, next);
        let now = Instant::now();
        self.state = next;
        self.metrics.last_state_change = Some(now);
        match next {
            CircuitState::Open => self.opened_at = Some(now),
            CircuitState::HalfOpen => self.metrics.consecutive_successes = 0,
            CircuitState::Closed => self.opened_at = None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            cooldown: Duration::from_secs(10),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures() {
        let mut cb = breaker();
        assert!(cb.allow_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        assert_eq!(cb.metrics().total_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_streak() {
        let mut cb = breaker();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown() {
        let mut cb = breaker();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());

        // A failed trial reopens immediately
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
