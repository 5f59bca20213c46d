//! Domain-driven configuration management for Chunkflow
//!
//! This crate provides modular configuration split by functional domains,
//! with validation, defaults, and environment variable support.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

// Re-export domain configurations
pub use domains::{
    logging::{LogFormat, LogLevel, LoggingConfig},
    pool::{BootstrapConfig, CategoryPoolConfig, PoolConfig},
    ChunkflowConfig,
};

// Re-export utilities
pub use domains::utils::serde_duration_ms;
pub use validation::Validatable;
