//! The structured logger collaborator
//!
//! The pool manager never creates a logger on its own: callers hand one in,
//! which keeps several managers (and tests) isolated from each other.

use crate::event::{LogEvent, LogLevel};
use std::sync::{Arc, Mutex};

/// Sink for structured log events
pub trait StructuredLogger: Send + Sync {
    fn log(&self, event: LogEvent);
}

/// Forwards events to the active `tracing` subscriber
#[derive(Debug, Clone, Default)]
pub struct TracingLogger;

impl TracingLogger {
    pub fn new() -> Self {
        Self
    }
}

impl StructuredLogger for TracingLogger {
    fn log(&self, event: LogEvent) {
        let fields = serde_json::to_string(&event.fields).unwrap_or_default();
        let error = event
            .error
            .as_ref()
            .map(|e| format!("{} ({}): {}", e.code, e.category, e.message));

        match event.level {
            LogLevel::Trace => tracing::trace!(fields = %fields, error = ?error, "{}", event.message),
            LogLevel::Debug => tracing::debug!(fields = %fields, error = ?error, "{}", event.message),
            LogLevel::Info => tracing::info!(fields = %fields, error = ?error, "{}", event.message),
            LogLevel::Warn => tracing::warn!(fields = %fields, error = ?error, "{}", event.message),
            LogLevel::Error => tracing::error!(fields = %fields, error = ?error, "{}", event.message),
        }
    }
}

/// Discards every event
#[derive(Debug, Clone, Default)]
pub struct NoopLogger;

impl StructuredLogger for NoopLogger {
    fn log(&self, _event: LogEvent) {}
}

/// Keeps events in memory, mostly for inspection in tests
#[derive(Debug, Clone, Default)]
pub struct BufferedLogger {
    events: Arc<Mutex<Vec<LogEvent>>>,
}

impl BufferedLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events logged so far
    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count_at(&self, level: LogLevel) -> usize {
        self.events().iter().filter(|e| e.level == level).count()
    }
}

impl StructuredLogger for BufferedLogger {
    fn log(&self, event: LogEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
