//! Fault details attached to structured log events

use crate::severity::{classify_fault, ErrorSeverity, FaultCategory};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub category: FaultCategory,
    pub severity: ErrorSeverity,
    pub is_retryable: bool,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub context: HashMap<String, JsonValue>,
}

impl ErrorInfo {
    /// Unclassified error with medium severity
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            category: FaultCategory::Unknown,
            severity: ErrorSeverity::Medium,
            is_retryable: true,
            context: HashMap::new(),
        }
    }

    /// Error whose category and severity come from [`classify_fault`]
    pub fn classified(code: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let (category, severity) = classify_fault(&message);
        Self {
            category,
            severity,
            is_retryable: severity.should_retry(),
            ..Self::new(code, message)
        }
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_context_value(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(json_value) = serde_json::to_value(value) {
            self.context.insert(key.into(), json_value);
        }
        self
    }
}
