//! Chunkflow Execution Engine
//!
//! This crate provides the worker pool behind Chunkflow: per-category pools of
//! execution contexts, a priority admission queue, health monitoring with
//! automatic restarts, adaptive sizing, segmented transfer of large payloads
//! and inline fallback when no context can take a task.

pub mod context;
pub(crate) mod dispatcher;
pub mod error;
pub mod events;
pub mod factory;
pub mod fallback;
pub mod handlers;
pub mod health;
pub mod launcher;
pub mod manager;
pub mod queue;
pub mod runtime;
pub mod sizing;
pub mod status;
pub mod task;
pub mod transfer;

// Re-export main types
pub use context::{ContextId, ContextSnapshot, ContextStatus};
pub use error::{ExecutionError, ExecutionResult};
pub use events::{ChannelEventSink, EventSink, LifecycleEvent, RestartReason, TracingEventSink};
pub use fallback::FallbackExecutor;
pub use handlers::{TaskHandler, TaskRegistry};
pub use launcher::{ContextLauncher, ContextLink, DefaultLauncher, KillSwitch};
pub use manager::{PoolManager, PoolManagerBuilder, TaskHandle};
pub use runtime::{worker_main, ContextRuntime, RuntimeStep};
pub use sizing::{NoPressure, PressureProbe, SysinfoProbe, SystemPressure};
pub use status::{CategoryStatus, PoolStatus, ShutdownReport};
pub use task::{TaskPayload, TaskSubmission, DEFAULT_PRIORITY};
pub use transfer::{LargeTaskAssembler, TransferPolicy};
