//! Error types for task execution

use chunkflow_config::ConfigError;
use chunkflow_ipc::{IpcError, TaskId};
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the pool manager
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Task execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Task {task_id} timed out after {after:?}")]
    Timeout { task_id: TaskId, after: Duration },

    #[error("Task cancelled: {0}")]
    Cancelled(String),

    #[error("Pool manager is shutting down")]
    ShuttingDown,

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Unknown task category: {0}")]
    UnknownCategory(String),

    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("No execution context available for category {0}")]
    NoContextAvailable(String),

    #[error("Large payload transfer failed: {0}")]
    TransferFailed(String),

    #[error("Execution context lost: {0}")]
    ContextLost(String),

    #[error("Execution context creation failed: {0}")]
    CreationFailed(String),

    #[error("Pool manager has stopped")]
    ManagerStopped,

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

impl ExecutionError {
    /// Stable code used in structured logs and fault events
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::Timeout { .. } => "TASK_TIMEOUT",
            ExecutionError::Cancelled(_) => "TASK_CANCELLED",
            ExecutionError::ShuttingDown => "SHUTTING_DOWN",
            ExecutionError::TaskFailed(_) => "TASK_FAILED",
            ExecutionError::UnknownCategory(_) => "UNKNOWN_CATEGORY",
            ExecutionError::UnknownTaskType(_) => "UNKNOWN_TASK_TYPE",
            ExecutionError::InvalidPayload(_) => "INVALID_PAYLOAD",
            ExecutionError::NoContextAvailable(_) => "NO_CONTEXT_AVAILABLE",
            ExecutionError::TransferFailed(_) => "TRANSFER_FAILED",
            ExecutionError::ContextLost(_) => "CONTEXT_LOST",
            ExecutionError::CreationFailed(_) => "CREATION_FAILED",
            ExecutionError::ManagerStopped => "MANAGER_STOPPED",
            ExecutionError::Ipc(_) => "IPC_ERROR",
            ExecutionError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    /// Whether the failure came from pool infrastructure rather than the task itself
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            ExecutionError::NoContextAvailable(_)
                | ExecutionError::TransferFailed(_)
                | ExecutionError::ContextLost(_)
                | ExecutionError::CreationFailed(_)
                | ExecutionError::Ipc(_)
        )
    }
}
