//! Lifecycle events emitted by the pool manager

use chunkflow_ipc::TaskId;
use chunkflow_logging::{ErrorSeverity, FaultCategory};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::context::ContextId;
use crate::status::PoolStatus;

/// Why a context was replaced
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestartReason {
    Unresponsive { streak: u32 },
    Faults { count: u32 },
    ChannelClosed,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartReason::Unresponsive { streak } => write!(f, "unresponsive ({} missed)", streak),
            RestartReason::Faults { count } => write!(f, "{} faults", count),
            RestartReason::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ContextCreated {
        context_id: ContextId,
        category: String,
    },
    ContextReady {
        context_id: ContextId,
        category: String,
    },
    ContextCreationFailed {
        category: String,
        reason: String,
    },
    ContextFault {
        context_id: ContextId,
        category: String,
        message: String,
        fault_category: FaultCategory,
        severity: ErrorSeverity,
    },
    ContextRestarted {
        old_context_id: ContextId,
        new_context_id: ContextId,
        category: String,
        reason: RestartReason,
    },
    FallbackExecuted {
        task_id: TaskId,
        category: String,
        task_type: String,
        reason: String,
    },
    ContextTerminated {
        context_id: ContextId,
        category: String,
        acknowledged: bool,
    },
    PoolMetrics(PoolStatus),
}

/// Receiver of lifecycle events, injected at construction
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Writes events to the tracing subscriber
#[derive(Debug, Clone, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: LifecycleEvent) {
        match &event {
            LifecycleEvent::ContextCreationFailed { .. }
            | LifecycleEvent::ContextFault { .. }
            | LifecycleEvent::ContextRestarted { .. } => {
                warn!(event = ?event, "pool lifecycle event");
            }
            LifecycleEvent::PoolMetrics(status) => {
                tracing::debug!(
                    contexts = status.contexts.len(),
                    active_tasks = status.active_tasks,
                    "pool metrics"
                );
            }
            _ => info!(event = ?event, "pool lifecycle event"),
        }
    }
}

/// Forwards events into a channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: UnboundedSender<LifecycleEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: UnboundedSender<LifecycleEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: LifecycleEvent) {
        // Nobody listening is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[test]
    fn test_event_wire_shape() {
        let event = LifecycleEvent::ContextRestarted {
            old_context_id: Uuid::nil(),
            new_context_id: Uuid::nil(),
            category: "hash".into(),
            reason: RestartReason::Unresponsive { streak: 3 },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "context_restarted");
        assert_eq!(value["reason"]["kind"], "unresponsive");
        assert_eq!(value["reason"]["streak"], 3);
    }

    #[test]
    fn test_channel_sink_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ChannelEventSink::new(tx);
        sink.emit(LifecycleEvent::ContextCreationFailed {
            category: "chunk".into(),
            reason: "boom".into(),
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            LifecycleEvent::ContextCreationFailed { ref category, .. } if category == "chunk"
        ));

        drop(rx);
        sink.emit(LifecycleEvent::ContextCreationFailed {
            category: "chunk".into(),
            reason: "nobody listens".into(),
        });
    }
}
