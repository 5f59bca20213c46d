//! Structured logging infrastructure for Chunkflow
//!
//! This crate provides:
//! - Tracing subscriber initialisation for the manager and worker processes
//! - The injectable [`StructuredLogger`] collaborator
//! - Advisory fault classification for context faults

pub mod error_info;
pub mod event;
pub mod init;
pub mod logger;
pub mod severity;

// Re-export main types for convenience
pub use error_info::ErrorInfo;
pub use event::{LogEvent, LogLevel};
pub use init::{init_logging_from_config, init_simple_tracing, init_worker_tracing};
pub use logger::{BufferedLogger, NoopLogger, StructuredLogger, TracingLogger};
pub use severity::{classify_fault, ErrorSeverity, FaultCategory};
