//! Inline execution when no context can take a task

use chunkflow_ipc::Payload;
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::error::{ExecutionError, ExecutionResult};
use crate::handlers::TaskRegistry;
use crate::task::TaskPayload;

/// Runs tasks with the same handlers the contexts use
#[derive(Debug, Clone)]
pub struct FallbackExecutor {
    registry: Arc<TaskRegistry>,
}

impl FallbackExecutor {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    pub fn supports(&self, task_type: &str) -> bool {
        self.registry.contains(task_type)
    }

    /// Execute on the calling thread
    pub fn run_inline(&self, task_type: &str, payload: Payload) -> ExecutionResult<JsonValue> {
        self.registry.execute(task_type, payload)
    }

    /// Execute on the blocking pool, loading file payloads first
    pub async fn run(&self, task_type: String, payload: TaskPayload) -> ExecutionResult<JsonValue> {
        let payload = match payload {
            TaskPayload::File(path) => {
                let data = tokio::fs::read(&path).await.map_err(|e| {
                    ExecutionError::TaskFailed(format!("cannot read {}: {}", path.display(), e))
                })?;
                Payload::Bytes(data.into())
            }
            TaskPayload::Bytes(bytes) => Payload::Bytes(bytes),
            TaskPayload::Json(value) => Payload::Json(value),
        };

        let executor = self.clone();
        tokio::task::spawn_blocking(move || executor.run_inline(&task_type, payload))
            .await
            .map_err(|e| ExecutionError::TaskFailed(format!("fallback execution aborted: {}", e)))?
    }
}
