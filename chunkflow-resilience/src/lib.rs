//! Resilience patterns for Chunkflow
//!
//! This crate provides the circuit breaker guarding context creation and the
//! shutdown coordination used by the pool manager.

pub mod circuit_breaker;
pub mod shutdown;

// Re-export commonly used types
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState};
pub use shutdown::{ProcessShutdownManager, ShutdownCoordinator, ShutdownError, ShutdownPhase};
