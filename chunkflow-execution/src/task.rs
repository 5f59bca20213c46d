//! Task model

use bytes::Bytes;
use chunkflow_ipc::{Payload, TaskId};
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Priority used when a submission does not set one. Lower is more urgent.
pub const DEFAULT_PRIORITY: u32 = 5;

/// Input of a task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPayload {
    /// Raw buffer
    Bytes(Bytes),
    /// Structured value
    Json(JsonValue),
    /// Large source read from disk when the task is delivered
    File(PathBuf),
}

impl TaskPayload {
    /// Size in bytes when known without encoding or I/O.
    ///
    /// JSON is only measured by encoding it, which is left to the delivery
    /// task so the control loop never serializes payloads.
    pub fn known_size(&self) -> Option<usize> {
        match self {
            TaskPayload::Bytes(bytes) => Some(bytes.len()),
            TaskPayload::Json(_) | TaskPayload::File(_) => None,
        }
    }

    /// Wire payload for in-memory inputs
    pub fn to_wire(&self) -> Option<Payload> {
        match self {
            TaskPayload::Bytes(bytes) => Some(Payload::Bytes(bytes.clone())),
            TaskPayload::Json(value) => Some(Payload::Json(value.clone())),
            TaskPayload::File(_) => None,
        }
    }
}

impl From<Bytes> for TaskPayload {
    fn from(bytes: Bytes) -> Self {
        TaskPayload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for TaskPayload {
    fn from(bytes: Vec<u8>) -> Self {
        TaskPayload::Bytes(Bytes::from(bytes))
    }
}

impl From<JsonValue> for TaskPayload {
    fn from(value: JsonValue) -> Self {
        TaskPayload::Json(value)
    }
}

impl From<PathBuf> for TaskPayload {
    fn from(path: PathBuf) -> Self {
        TaskPayload::File(path)
    }
}

/// What a caller hands to [`crate::PoolManager::submit`]
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub category: String,
    pub task_type: String,
    pub payload: TaskPayload,
    pub priority: u32,
    pub timeout: Option<Duration>,
}

impl TaskSubmission {
    pub fn new(
        category: impl Into<String>,
        task_type: impl Into<String>,
        payload: impl Into<TaskPayload>,
    ) -> Self {
        Self {
            category: category.into(),
            task_type: task_type.into(),
            payload: payload.into(),
            priority: DEFAULT_PRIORITY,
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// An admitted task. Immutable once created.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub id: TaskId,
    pub category: String,
    pub task_type: String,
    pub payload: TaskPayload,
    pub priority: u32,
    pub timeout: Duration,
    pub submitted_at: Instant,
}

impl TaskRequest {
    pub(crate) fn from_submission(submission: TaskSubmission, default_timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: submission.category,
            task_type: submission.task_type,
            payload: submission.payload,
            priority: submission.priority,
            timeout: submission.timeout.unwrap_or(default_timeout),
            submitted_at: Instant::now(),
        }
    }
}
