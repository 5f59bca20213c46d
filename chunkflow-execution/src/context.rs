//! Execution context bookkeeping owned by the control loop

use chrono::{DateTime, Utc};
use chunkflow_ipc::{TaskId, WorkerMessage};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{ExecutionError, ExecutionResult};
use crate::launcher::KillSwitch;

pub type ContextId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    Idle,
    Busy,
    Error,
    Unresponsive,
}

impl std::fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextStatus::Idle => write!(f, "idle"),
            ContextStatus::Busy => write!(f, "busy"),
            ContextStatus::Error => write!(f, "error"),
            ContextStatus::Unresponsive => write!(f, "unresponsive"),
        }
    }
}

/// Point-in-time copy of a context, safe to hand out
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub id: ContextId,
    pub category: String,
    pub status: ContextStatus,
    pub tasks_completed: u64,
    pub error_count: u32,
    pub unresponsive_streak: u32,
    pub current_task: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub last_response_at: DateTime<Utc>,
}

/// A live context as tracked by the control loop
pub struct ExecutionContext {
    pub id: ContextId,
    pub category: String,
    pub status: ContextStatus,
    pub tasks_completed: u64,
    pub error_count: u32,
    pub unresponsive_streak: u32,
    pub created_at: DateTime<Utc>,
    pub last_response_at: DateTime<Utc>,
    pub current_task: Option<TaskId>,
    pub probe_outstanding: bool,
    outbox: UnboundedSender<WorkerMessage>,
    kill: KillSwitch,
    pump: Option<JoinHandle<()>>,
}

impl ExecutionContext {
    pub fn new(
        id: ContextId,
        category: String,
        outbox: UnboundedSender<WorkerMessage>,
        kill: KillSwitch,
        pump: JoinHandle<()>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            category,
            status: ContextStatus::Idle,
            tasks_completed: 0,
            error_count: 0,
            unresponsive_streak: 0,
            created_at: now,
            last_response_at: now,
            current_task: None,
            probe_outstanding: false,
            outbox,
            kill,
            pump: Some(pump),
        }
    }

    /// Idle and not owning a task
    pub fn is_available(&self) -> bool {
        self.status == ContextStatus::Idle && self.current_task.is_none()
    }

    pub fn outbox(&self) -> &UnboundedSender<WorkerMessage> {
        &self.outbox
    }

    pub fn send(&self, message: WorkerMessage) -> ExecutionResult<()> {
        self.outbox
            .send(message)
            .map_err(|_| ExecutionError::ContextLost(format!("context {} channel closed", self.id)))
    }

    pub fn assign(&mut self, task_id: TaskId) {
        self.current_task = Some(task_id);
        self.status = ContextStatus::Busy;
    }

    /// Give up the current task. Error status is sticky.
    pub fn release(&mut self) -> Option<TaskId> {
        let task = self.current_task.take();
        if matches!(self.status, ContextStatus::Busy) {
            self.status = ContextStatus::Idle;
        }
        task
    }

    /// A timely response or pong: the context is healthy again
    pub fn record_response(&mut self) {
        self.last_response_at = Utc::now();
        self.unresponsive_streak = 0;
        self.probe_outstanding = false;
        self.leave_unresponsive();
    }

    /// A response for a task that already timed out. The context is back in
    /// service but its streak stands until it answers on time.
    pub fn record_late_response(&mut self) {
        self.last_response_at = Utc::now();
        self.leave_unresponsive();
    }

    /// Timeout or missed probe
    pub fn record_missed(&mut self) -> u32 {
        self.unresponsive_streak += 1;
        if self.status != ContextStatus::Error {
            self.status = ContextStatus::Unresponsive;
        }
        self.unresponsive_streak
    }

    pub fn record_fault(&mut self) -> u32 {
        self.error_count += 1;
        self.error_count
    }

    pub fn mark_error(&mut self) {
        self.status = ContextStatus::Error;
    }

    fn leave_unresponsive(&mut self) {
        if self.status == ContextStatus::Unresponsive {
            self.status = if self.current_task.is_some() {
                ContextStatus::Busy
            } else {
                ContextStatus::Idle
            };
        }
    }

    /// Stop listening to the context and destroy it
    pub fn destroy(mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.kill.trigger();
    }

    /// Stop listening and destroy the context once `grace` has passed
    pub fn retire(mut self, grace: Duration) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        let mut kill = std::mem::replace(&mut self.kill, KillSwitch::noop());
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            kill.trigger();
        });
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            id: self.id,
            category: self.category.clone(),
            status: self.status,
            tasks_completed: self.tasks_completed,
            error_count: self.error_count,
            unresponsive_streak: self.unresponsive_streak,
            current_task: self.current_task,
            created_at: self.created_at,
            last_response_at: self.last_response_at,
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("status", &self.status)
            .field("current_task", &self.current_task)
            .finish()
    }
}
